use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, Socket, Type};
use tracing::trace;

use crate::config::HTTP_CONNECT_TIMEOUT;
use crate::error::{Error, Result};

/// Blocking-with-deadline byte stream. The single implementation speaks
/// plain TCP; an https session substitutes its own implementation behind
/// the same seam.
pub trait Stream: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> Result<usize>;
    fn local_addr(&self) -> Result<SocketAddr>;
    fn shutdown_both(&mut self);
}

/// Wait until `fd` is ready for `flags` or the deadline passes.
/// Returns false on timeout.
pub fn wait_fd(fd: BorrowedFd<'_>, flags: PollFlags, deadline: Instant) -> Result<bool> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        let remaining = deadline - now;
        let millis = u16::try_from(remaining.as_millis().max(1)).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(fd, flags)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => continue,
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                if revents.intersects(flags | PollFlags::POLLERR | PollFlags::POLLHUP) {
                    return Ok(true);
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(Error::SocketError(e.into())),
        }
    }
}

struct TcpStreamWrapper {
    stream: TcpStream,
}

impl Stream for TcpStreamWrapper {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            if !wait_fd(self.stream.as_fd(), PollFlags::POLLIN, deadline)? {
                return Err(Error::Timeout);
            }
            match self.stream.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(Error::SocketRead),
            }
        }
    }

    fn write_all(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;
        while written < buf.len() {
            if !wait_fd(self.stream.as_fd(), PollFlags::POLLOUT, deadline)? {
                return Err(Error::Timeout);
            }
            match self.stream.write(&buf[written..]) {
                Ok(0) => return Err(Error::SocketWrite),
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return Err(Error::SocketWrite),
            }
        }
        Ok(written)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    fn shutdown_both(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// One accepted or initiated stream endpoint with its peer address.
pub struct Connection {
    stream: Box<dyn Stream>,
    pub peer: SocketAddr,
}

impl Connection {
    pub fn from_tcp(stream: TcpStream, peer: SocketAddr) -> Result<Connection> {
        stream.set_nonblocking(true)?;
        Ok(Connection {
            stream: Box::new(TcpStreamWrapper { stream }),
            peer,
        })
    }

    pub fn from_stream(stream: Box<dyn Stream>, peer: SocketAddr) -> Connection {
        Connection { stream, peer }
    }

    /// Nonblocking connect bounded by the standard 5 second limit.
    pub fn connect(addr: SocketAddr) -> Result<Connection> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, None).map_err(|_| Error::OutOfSocket)?;
        socket.set_nonblocking(true)?;
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(nix::libc::EINPROGRESS) => {
                let deadline = Instant::now() + HTTP_CONNECT_TIMEOUT;
                if !wait_fd(socket.as_fd(), PollFlags::POLLOUT, deadline)? {
                    return Err(Error::SocketConnect);
                }
                if let Ok(Some(_)) | Err(_) = socket.take_error() {
                    return Err(Error::SocketConnect);
                }
            }
            Err(_) => return Err(Error::SocketConnect),
        }
        trace!(addr = %addr, "connected");
        let stream: TcpStream = socket.into();
        Connection::from_tcp(stream, addr)
    }

    /// One bounded read. May return less than `buf.len()`; 0 means EOF.
    pub fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream.read(buf, timeout)
    }

    /// Write the whole buffer, accumulating partial sends until done or the
    /// deadline passes.
    pub fn write_all(&mut self, buf: &[u8], timeout: Duration) -> Result<usize> {
        self.stream.write_all(buf, timeout)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.stream.local_addr()
    }

    /// Graceful teardown, both directions.
    pub fn shutdown(&mut self) {
        self.stream.shutdown_both();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stream.shutdown_both();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
        });
        let mut conn = Connection::connect(addr).unwrap();
        conn.write_all(b"hello", Duration::from_secs(5)).unwrap();
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += conn.read(&mut buf[got..], Duration::from_secs(5)).unwrap();
        }
        assert_eq!(&buf, b"hello");
        server.join().unwrap();
    }

    #[test]
    fn test_read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut conn = Connection::connect(addr).unwrap();
        let mut buf = [0u8; 1];
        let start = Instant::now();
        let err = conn.read(&mut buf, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(90));
        drop(listener);
    }

    #[test]
    fn test_connect_refused() {
        // Bind and drop to get a port that is very likely closed.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        assert!(Connection::connect(addr).is_err());
    }
}
