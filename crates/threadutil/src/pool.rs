use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

/// A runnable unit of work. The free-function of the C-style job API is
/// subsumed by the closure owning its argument.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Med,
    High,
}

#[derive(thiserror::Error, Debug)]
pub enum PoolError {
    #[error("job queue is full ({0} jobs queued)")]
    MaxJobsTotal(usize),
    #[error("pool is at its thread limit ({0} threads)")]
    MaxThreads(usize),
    #[error("pool is shut down")]
    Shutdown,
}

/// Tuning knobs. Defaults match the classic SDK values.
#[derive(Debug, Clone)]
pub struct ThreadPoolAttr {
    pub min_threads: usize,
    pub max_threads: usize,
    /// How long an idle worker above `min_threads` lingers before retiring.
    pub max_idle_time: Duration,
    /// Queued-jobs-per-worker ratio that triggers spawning a new worker.
    pub jobs_per_thread: usize,
    pub max_jobs_total: usize,
    /// Queue wait after which a job is promoted one priority class.
    pub starvation_time: Duration,
}

impl Default for ThreadPoolAttr {
    fn default() -> Self {
        Self {
            min_threads: 1,
            max_threads: 10,
            max_idle_time: Duration::from_secs(10),
            jobs_per_thread: 10,
            max_jobs_total: 100,
            starvation_time: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub jobs_high: usize,
    pub jobs_med: usize,
    pub jobs_low: usize,
    pub total_threads: usize,
    pub busy_threads: usize,
    pub persistent_threads: usize,
}

struct QueuedJob {
    job: Job,
    enqueued: Instant,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<QueuedJob>,
    med: VecDeque<QueuedJob>,
    low: VecDeque<QueuedJob>,
}

impl Queues {
    fn total(&self) -> usize {
        self.high.len() + self.med.len() + self.low.len()
    }

    fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

struct PoolState {
    queues: Queues,
    total_threads: usize,
    busy_threads: usize,
    persistent_threads: usize,
    shutdown: bool,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    attr: ThreadPoolAttr,
    state: Mutex<PoolState>,
    job_ready: Condvar,
    job_done: Condvar,
}

/// Fixed-priority worker pool. Workers pop HIGH before MED before LOW, with
/// jobs past `starvation_time` promoted one class at dequeue. Persistent
/// jobs each occupy a dedicated worker and bypass the queues entirely.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

impl ThreadPool {
    pub fn new(attr: ThreadPoolAttr) -> ThreadPool {
        let attr = ThreadPoolAttr {
            max_threads: attr.max_threads.max(attr.min_threads).max(1),
            ..attr
        };
        let pool = ThreadPool {
            inner: Arc::new(Inner {
                attr,
                state: Mutex::new(PoolState {
                    queues: Queues::default(),
                    total_threads: 0,
                    busy_threads: 0,
                    persistent_threads: 0,
                    shutdown: false,
                    handles: Vec::new(),
                }),
                job_ready: Condvar::new(),
                job_done: Condvar::new(),
            }),
        };
        {
            let mut state = pool.inner.state.lock();
            for _ in 0..pool.inner.attr.min_threads {
                pool.spawn_worker(&mut state);
            }
        }
        pool
    }

    pub fn attr(&self) -> &ThreadPoolAttr {
        &self.inner.attr
    }

    /// Queue a job. Spawns an extra worker when the jobs-per-thread ratio is
    /// exceeded and the pool is below `max_threads`.
    pub fn add(&self, priority: Priority, job: Job) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        let total = state.queues.total();
        if total >= self.inner.attr.max_jobs_total {
            return Err(PoolError::MaxJobsTotal(total));
        }
        let queued = QueuedJob {
            job,
            enqueued: Instant::now(),
        };
        match priority {
            Priority::High => state.queues.high.push_back(queued),
            Priority::Med => state.queues.med.push_back(queued),
            Priority::Low => state.queues.low.push_back(queued),
        }
        self.maybe_spawn_worker(&mut state);
        drop(state);
        self.inner.job_ready.notify_one();
        Ok(())
    }

    /// Run a long-lived job on a dedicated worker. The worker never serves
    /// the queues and is excluded from idle retirement and starvation aging.
    pub fn add_persistent(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("threadutil-persistent".to_owned())
            .spawn(move || {
                run_guarded(job);
                let mut state = inner.state.lock();
                state.total_threads -= 1;
                state.persistent_threads -= 1;
                drop(state);
                inner.job_done.notify_all();
            })
            .map_err(|e| {
                warn!("error spawning persistent worker: {e}");
                PoolError::MaxThreads(state.total_threads)
            })?;
        // The new thread blocks on the state lock we still hold, so the
        // counters are consistent by the time it runs.
        state.total_threads += 1;
        state.persistent_threads += 1;
        state.handles.push(handle);
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let state = self.inner.state.lock();
        Stats {
            jobs_high: state.queues.high.len(),
            jobs_med: state.queues.med.len(),
            jobs_low: state.queues.low.len(),
            total_threads: state.total_threads,
            busy_threads: state.busy_threads,
            persistent_threads: state.persistent_threads,
        }
    }

    /// Wait for all queued jobs to drain, then join every worker.
    /// Persistent jobs must have been told to exit before calling this.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        while !(state.queues.is_empty() && state.busy_threads == 0) {
            self.inner.job_done.wait(&mut state);
        }
        state.shutdown = true;
        let handles = std::mem::take(&mut state.handles);
        drop(state);
        self.inner.job_ready.notify_all();
        for handle in handles {
            if let Err(e) = handle.join() {
                warn!("worker exited abnormally: {e:?}");
            }
        }
        debug!("thread pool shut down");
    }

    fn maybe_spawn_worker(&self, state: &mut PoolState) {
        let workers = state.total_threads - state.persistent_threads;
        if workers >= self.inner.attr.max_threads {
            return;
        }
        let idle = workers - state.busy_threads.min(workers);
        if idle > 0 && state.queues.total() <= idle {
            return;
        }
        if workers == 0 || state.queues.total() / workers >= self.inner.attr.jobs_per_thread {
            self.spawn_worker(state);
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) {
        let inner = self.inner.clone();
        match std::thread::Builder::new()
            .name("threadutil-worker".to_owned())
            .spawn(move || worker_loop(inner))
        {
            Ok(handle) => {
                state.total_threads += 1;
                state.handles.push(handle);
            }
            Err(e) => warn!("error spawning worker: {e}"),
        }
    }
}

/// Move starved queue heads up one priority class. Promotion keeps FIFO
/// order within the destination class.
fn age_queues(queues: &mut Queues, starvation_time: Duration) {
    let now = Instant::now();
    let starved =
        |job: &QueuedJob| now.duration_since(job.enqueued) >= starvation_time;
    while queues.med.front().is_some_and(starved) {
        if let Some(job) = queues.med.pop_front() {
            trace!("promoting starved MED job to HIGH");
            queues.high.push_back(job);
        }
    }
    while queues.low.front().is_some_and(starved) {
        if let Some(job) = queues.low.pop_front() {
            trace!("promoting starved LOW job to MED");
            queues.med.push_back(job);
        }
    }
}

fn pop_job(queues: &mut Queues, starvation_time: Duration) -> Option<QueuedJob> {
    age_queues(queues, starvation_time);
    queues
        .high
        .pop_front()
        .or_else(|| queues.med.pop_front())
        .or_else(|| queues.low.pop_front())
}

fn run_guarded(job: Job) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
        warn!("job panicked");
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut state = inner.state.lock();
    loop {
        if let Some(queued) = pop_job(&mut state.queues, inner.attr.starvation_time) {
            state.busy_threads += 1;
            drop(state);
            run_guarded(queued.job);
            state = inner.state.lock();
            state.busy_threads -= 1;
            drop(state);
            inner.job_done.notify_all();
            state = inner.state.lock();
            continue;
        }
        if state.shutdown {
            state.total_threads -= 1;
            return;
        }
        let timed_out = inner
            .job_ready
            .wait_for(&mut state, inner.attr.max_idle_time)
            .timed_out();
        if timed_out
            && state.queues.is_empty()
            && !state.shutdown
            && state.total_threads - state.persistent_threads > inner.attr.min_threads
        {
            // Idle past the limit, retire.
            state.total_threads -= 1;
            return;
        }
    }
}
