use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::pool::{Job, PoolError, Priority, ThreadPool};

struct TimerEvent {
    id: u64,
    deadline: Instant,
    priority: Priority,
    job: Job,
}

struct TimerState {
    // Sorted by deadline; insertion keeps the order.
    events: Vec<TimerEvent>,
    next_id: u64,
    shutdown: bool,
    running: bool,
}

struct Inner {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Deadline queue driven by a persistent pool job. Due jobs are handed to
/// the thread pool, never executed on the timer worker itself.
#[derive(Clone)]
pub struct TimerThread {
    inner: Arc<Inner>,
    pool: ThreadPool,
}

impl TimerThread {
    /// Registers the timer loop as a persistent job on `pool`.
    pub fn start(pool: &ThreadPool) -> Result<TimerThread, PoolError> {
        let timer = TimerThread {
            inner: Arc::new(Inner {
                state: Mutex::new(TimerState {
                    events: Vec::new(),
                    next_id: 0,
                    shutdown: false,
                    running: true,
                }),
                cond: Condvar::new(),
            }),
            pool: pool.clone(),
        };
        let loop_timer = timer.clone();
        pool.add_persistent(Box::new(move || loop_timer.run()))?;
        Ok(timer)
    }

    /// Schedule `job` to be queued into the pool after `delay`.
    /// Returns an event id usable with [`TimerThread::remove`].
    pub fn schedule(&self, delay: Duration, priority: Priority, job: Job) -> Result<u64, PoolError> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        let id = state.next_id;
        state.next_id += 1;
        let deadline = Instant::now() + delay;
        let pos = state.events.partition_point(|e| e.deadline <= deadline);
        state.events.insert(
            pos,
            TimerEvent {
                id,
                deadline,
                priority,
                job,
            },
        );
        drop(state);
        self.inner.cond.notify_one();
        Ok(id)
    }

    /// Cancel a scheduled event. Returns false if it already fired.
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.events.len();
        state.events.retain(|e| e.id != id);
        state.events.len() != before
    }

    /// Stop the timer loop. Pending events are dropped unfired.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        state.events.clear();
        self.inner.cond.notify_all();
        while state.running {
            self.inner.cond.wait(&mut state);
        }
        debug!("timer thread shut down");
    }

    fn run(&self) {
        let mut state = self.inner.state.lock();
        loop {
            if state.shutdown {
                state.running = false;
                self.inner.cond.notify_all();
                return;
            }
            let now = Instant::now();
            match state.events.first() {
                None => {
                    self.inner.cond.wait(&mut state);
                }
                Some(front) if front.deadline <= now => {
                    let event = state.events.remove(0);
                    drop(state);
                    if let Err(e) = self.pool.add(event.priority, event.job) {
                        warn!(id = event.id, "error queueing timer job: {e}");
                    }
                    state = self.inner.state.lock();
                }
                Some(front) => {
                    let wait = front.deadline - now;
                    self.inner.cond.wait_for(&mut state, wait);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pool::ThreadPoolAttr;

    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let pool = ThreadPool::new(ThreadPoolAttr::default());
        let timer = TimerThread::start(&pool).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        timer
            .schedule(
                Duration::from_millis(80),
                Priority::Med,
                Box::new(move || o.lock().push(2)),
            )
            .unwrap();
        let o = order.clone();
        timer
            .schedule(
                Duration::from_millis(20),
                Priority::Med,
                Box::new(move || o.lock().push(1)),
            )
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*order.lock(), vec![1, 2]);
        timer.shutdown();
        pool.shutdown();
    }

    #[test]
    fn test_removed_event_does_not_fire() {
        let pool = ThreadPool::new(ThreadPoolAttr::default());
        let timer = TimerThread::start(&pool).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let id = timer
            .schedule(
                Duration::from_millis(200),
                Priority::Med,
                Box::new(move || {
                    f.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert!(timer.remove(id));
        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        timer.shutdown();
        pool.shutdown();
    }
}
