use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::sync::Arc;
use std::time::Duration;

use bstr::BStr;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::{Condvar, Mutex};
use socket2::{Domain, Socket, Type};
use threadutil::Priority;
use tracing::{debug, error, info, warn};

use crate::config::APPLICATION_LISTENING_PORT;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::sock::Connection;
use crate::ssdp;
use crate::state::ServerState;

const STOP_SENTINEL: &[u8] = b"ShutDown\0";

/// Ports actually bound by [`start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Ports {
    pub port4: u16,
    pub port6: u16,
    pub port6_ula_gua: u16,
    pub stop_port: u16,
}

/// Every listening socket the miniserver owns. A `None` field is the
/// invalid-socket sentinel; the run loop only polls bound sockets.
struct MiniServerSockArray {
    http4: Option<TcpListener>,
    http6: Option<TcpListener>,
    http6_ula_gua: Option<TcpListener>,
    stop: UdpSocket,
    ssdp4: Option<UdpSocket>,
    ssdp6: Option<UdpSocket>,
    ssdp6_ula_gua: Option<UdpSocket>,
    ssdp_req4: Option<UdpSocket>,
    ssdp_req6: Option<UdpSocket>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockKind {
    Http4,
    Http6,
    Http6UlaGua,
    Ssdp4,
    Ssdp6,
    Ssdp6UlaGua,
    SsdpReq4,
    SsdpReq6,
    Stop,
}

struct RunFlag {
    running: Mutex<bool>,
    cond: Condvar,
}

/// Handle to a started miniserver; [`MiniServerHandle::stop`] terminates the
/// listener via the loopback sentinel datagram.
pub struct MiniServerHandle {
    ports: Ports,
    flag: Arc<RunFlag>,
}

impl MiniServerHandle {
    pub fn ports(&self) -> Ports {
        self.ports
    }

    pub fn is_running(&self) -> bool {
        *self.flag.running.lock()
    }

    /// Send `"ShutDown\0"` from 127.0.0.1 to the stop port until the
    /// listener reports idle.
    pub fn stop(&self) -> Result<()> {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, self.ports.stop_port));
        let mut running = self.flag.running.lock();
        while *running {
            sock.send_to(STOP_SENTINEL, dest)?;
            self.flag
                .cond
                .wait_for(&mut running, Duration::from_millis(50));
        }
        Ok(())
    }
}

fn next_port(port: u16) -> u16 {
    match port.checked_add(1) {
        Some(p) => p,
        None => APPLICATION_LISTENING_PORT,
    }
}

/// Bind a listener, hunting upward from the port hint until it wraps back
/// to the start.
fn bind_listen(ip: IpAddr, start_port: u16, reuseaddr: bool) -> Result<(TcpListener, u16)> {
    let start_port = if start_port == 0 {
        APPLICATION_LISTENING_PORT
    } else {
        start_port
    };
    let mut try_port = start_port;
    let mut attempts: u32 = 0;
    loop {
        let domain = if ip.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let sock = Socket::new(domain, Type::STREAM, None).map_err(|_| Error::OutOfSocket)?;
        if ip.is_ipv6() {
            sock.set_only_v6(true).map_err(|_| Error::OutOfSocket)?;
        }
        if reuseaddr {
            sock.set_reuse_address(true).map_err(|_| Error::OutOfSocket)?;
        }
        let addr = SocketAddr::new(ip, try_port);
        match sock.bind(&addr.into()) {
            Ok(()) => match sock.listen(128) {
                Ok(()) => {
                    sock.set_nonblocking(true)?;
                    let listener: TcpListener = sock.into();
                    let actual = listener
                        .local_addr()
                        .map_err(|_| Error::InternalError)?
                        .port();
                    debug!(%ip, port = actual, "listening");
                    return Ok((listener, actual));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {}
                Err(_) => return Err(Error::Listen),
            },
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {}
            Err(_) => return Err(Error::SocketBind),
        }
        try_port = next_port(try_port);
        attempts += 1;
        if try_port == start_port || attempts > u16::MAX as u32 {
            return Err(Error::SocketBind);
        }
    }
}

/// Start the miniserver: bind the HTTP listeners (0 hints pick the default
/// application port), the loopback stop socket and the SSDP sockets, then
/// run the listener loop as a persistent pool job.
pub fn start(
    state: &Arc<ServerState>,
    listen_port4: u16,
    listen_port6: u16,
    listen_port6_ula_gua: u16,
) -> Result<MiniServerHandle> {
    let port6_hint = if listen_port6 == 0 {
        APPLICATION_LISTENING_PORT
    } else {
        listen_port6
    };
    let port6_ula_gua_hint = if listen_port6_ula_gua == 0 {
        next_port(port6_hint)
    } else {
        listen_port6_ula_gua
    };
    let reuseaddr = state.config.reuseaddr;

    let http4 = match bind_listen(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen_port4, reuseaddr) {
        Ok(bound) => Some(bound),
        Err(e) => {
            warn!("no IPv4 HTTP listener: {e}");
            None
        }
    };
    let http6 = match bind_listen(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port6_hint, reuseaddr) {
        Ok(bound) => Some(bound),
        Err(e) => {
            warn!("no IPv6 HTTP listener: {e}");
            None
        }
    };
    let http6_ula_gua = match bind_listen(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        port6_ula_gua_hint,
        reuseaddr,
    ) {
        Ok(bound) => Some(bound),
        Err(e) => {
            warn!("no IPv6 ULA/GUA HTTP listener: {e}");
            None
        }
    };
    if http4.is_none() && http6.is_none() {
        error!("no protocols available");
        return Err(Error::OutOfSocket);
    }

    let stop = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|_| Error::OutOfSocket)?;
    let stop_port = stop.local_addr().map_err(|_| Error::InternalError)?.port();

    let ssdp4 = ssdp::bind_v4_socket()
        .map_err(|e| warn!("error creating IPv4 SSDP socket: {e:#}"))
        .ok();
    let ssdp6 = ssdp::bind_v6_socket(true)
        .map_err(|e| warn!("error creating IPv6 SSDP socket: {e:#}"))
        .ok();
    let ssdp6_ula_gua = ssdp::bind_v6_socket(false)
        .map_err(|e| warn!("error creating IPv6 ULA/GUA SSDP socket: {e:#}"))
        .ok();
    let (ssdp_req4, ssdp_req6) = if state.config.client_ssdp_sockets {
        (
            ssdp::bind_request_socket(false)
                .map_err(|e| warn!("error creating IPv4 SSDP request socket: {e:#}"))
                .ok(),
            ssdp::bind_request_socket(true)
                .map_err(|e| warn!("error creating IPv6 SSDP request socket: {e:#}"))
                .ok(),
        )
    } else {
        (None, None)
    };

    let mut ports = Ports {
        stop_port,
        ..Default::default()
    };
    let (http4, port4) = match http4 {
        Some((l, p)) => (Some(l), p),
        None => (None, 0),
    };
    let (http6, port6) = match http6 {
        Some((l, p)) => (Some(l), p),
        None => (None, 0),
    };
    let (http6_ula_gua, port6_ula_gua) = match http6_ula_gua {
        Some((l, p)) => (Some(l), p),
        None => (None, 0),
    };
    ports.port4 = port4;
    ports.port6 = port6;
    ports.port6_ula_gua = port6_ula_gua;

    let socks = MiniServerSockArray {
        http4,
        http6,
        http6_ula_gua,
        stop,
        ssdp4,
        ssdp6,
        ssdp6_ula_gua,
        ssdp_req4,
        ssdp_req6,
    };

    let flag = Arc::new(RunFlag {
        running: Mutex::new(true),
        cond: Condvar::new(),
    });
    let job_state = state.clone();
    let job_flag = flag.clone();
    state
        .pool
        .add_persistent(Box::new(move || {
            run_miniserver(job_state, socks, &job_flag);
        }))
        .map_err(|e| {
            warn!("cannot start listener job: {e}");
            *flag.running.lock() = false;
            Error::InternalError
        })?;

    info!(
        port4 = ports.port4,
        port6 = ports.port6,
        port6_ula_gua = ports.port6_ula_gua,
        stop_port = ports.stop_port,
        "miniserver started"
    );
    Ok(MiniServerHandle { ports, flag })
}

/// Only monitor plausible, bound descriptors; a stray handle would make the
/// readiness call fail for the whole set.
fn fd_if_valid(fd: BorrowedFd<'_>) -> Option<BorrowedFd<'_>> {
    let raw = fd.as_raw_fd();
    if raw < 3 || raw >= nix::libc::FD_SETSIZE as i32 {
        warn!(fd = raw, "socket not monitored by the listener");
        return None;
    }
    Some(fd)
}

fn web_server_accept(state: &Arc<ServerState>, listener: &TcpListener) {
    let (stream, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
        Err(e) => {
            error!("error in accept: {e}");
            return;
        }
    };
    info!(%peer, fd = stream.as_raw_fd(), "connected to host");
    schedule_request_job(state, stream, peer);
}

fn schedule_request_job(state: &Arc<ServerState>, stream: std::net::TcpStream, peer: SocketAddr) {
    let conn = match Connection::from_tcp(stream, peer) {
        Ok(conn) => conn,
        Err(e) => {
            warn!(%peer, "error setting up connection: {e}");
            return;
        }
    };
    let job_state = state.clone();
    if let Err(e) = state.pool.add(
        Priority::Med,
        Box::new(move || dispatch::handle_request(job_state, conn)),
    ) {
        // The connection is dropped (and thereby closed) with the job.
        warn!(%peer, "cannot schedule request: {e}");
    }
}

fn ssdp_read(state: &Arc<ServerState>, slot: &mut Option<UdpSocket>) {
    let Some(sock) = slot.as_ref() else {
        return;
    };
    let result = match state.ssdp_handler() {
        Some(handler) => ssdp::read_datagram(sock, handler.as_ref()),
        None => {
            // No engine registered; drain and drop the datagram.
            let mut buf = [0u8; 1];
            sock.recv_from(&mut buf).map(|_| ()).map_err(Into::into)
        }
    };
    if let Err(e) = result {
        error!("error reading SSDP socket, closing it: {e:#}");
        *slot = None;
    }
}

/// The received datagram must match the sentinel exactly and come from
/// 127.0.0.1, so the stack cannot be terminated from a remote address.
fn receive_from_stop_sock(sock: &UdpSocket) -> bool {
    let mut buf = [0u8; 32];
    let (n, from) = match sock.recv_from(&mut buf) {
        Ok(received) => received,
        Err(e) => {
            error!("failed to receive from stop socket, stopping miniserver: {e}");
            return true;
        }
    };
    let payload = &buf[..n];
    if from.ip() == IpAddr::V4(Ipv4Addr::LOCALHOST) && payload == STOP_SENTINEL {
        info!(%from, "received stop datagram, stopping miniserver");
        return true;
    }
    warn!(
        payload = ?BStr::new(payload),
        %from,
        "ignoring datagram on stop socket, must be \"ShutDown\\0\" from 127.0.0.1"
    );
    false
}

fn run_miniserver(state: Arc<ServerState>, mut socks: MiniServerSockArray, flag: &RunFlag) {
    debug!("listener running");
    let mut stop = false;
    while !stop {
        let mut candidates: Vec<(SockKind, BorrowedFd<'_>)> =
            vec![(SockKind::Stop, socks.stop.as_fd())];
        if let Some(s) = &socks.http4 {
            candidates.push((SockKind::Http4, s.as_fd()));
        }
        if let Some(s) = &socks.http6 {
            candidates.push((SockKind::Http6, s.as_fd()));
        }
        if let Some(s) = &socks.http6_ula_gua {
            candidates.push((SockKind::Http6UlaGua, s.as_fd()));
        }
        if let Some(s) = &socks.ssdp4 {
            candidates.push((SockKind::Ssdp4, s.as_fd()));
        }
        if let Some(s) = &socks.ssdp6 {
            candidates.push((SockKind::Ssdp6, s.as_fd()));
        }
        if let Some(s) = &socks.ssdp6_ula_gua {
            candidates.push((SockKind::Ssdp6UlaGua, s.as_fd()));
        }
        if let Some(s) = &socks.ssdp_req4 {
            candidates.push((SockKind::SsdpReq4, s.as_fd()));
        }
        if let Some(s) = &socks.ssdp_req6 {
            candidates.push((SockKind::SsdpReq6, s.as_fd()));
        }

        let mut kinds: Vec<SockKind> = Vec::new();
        let mut fds: Vec<PollFd<'_>> = Vec::new();
        for (kind, fd) in candidates {
            if let Some(fd) = fd_if_valid(fd) {
                kinds.push(kind);
                fds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            // A closed descriptor slipped into the set; the per-socket
            // validity checks above will drop it next round.
            Err(nix::errno::Errno::EBADF) => continue,
            Err(e) => {
                error!("error in poll, stopping listener: {e}");
                break;
            }
        }

        let ready: Vec<SockKind> = kinds
            .iter()
            .zip(fds.iter())
            .filter(|(_, fd)| {
                fd.revents()
                    .map(|r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP)
                    })
                    .unwrap_or(false)
            })
            .map(|(kind, _)| *kind)
            .collect();
        drop(fds);

        for kind in ready {
            match kind {
                SockKind::Http4 => {
                    if let Some(l) = &socks.http4 {
                        web_server_accept(&state, l);
                    }
                }
                SockKind::Http6 => {
                    if let Some(l) = &socks.http6 {
                        web_server_accept(&state, l);
                    }
                }
                SockKind::Http6UlaGua => {
                    if let Some(l) = &socks.http6_ula_gua {
                        web_server_accept(&state, l);
                    }
                }
                SockKind::Ssdp4 => ssdp_read(&state, &mut socks.ssdp4),
                SockKind::Ssdp6 => ssdp_read(&state, &mut socks.ssdp6),
                SockKind::Ssdp6UlaGua => ssdp_read(&state, &mut socks.ssdp6_ula_gua),
                SockKind::SsdpReq4 => ssdp_read(&state, &mut socks.ssdp_req4),
                SockKind::SsdpReq6 => ssdp_read(&state, &mut socks.ssdp_req6),
                SockKind::Stop => {
                    if receive_from_stop_sock(&socks.stop) {
                        stop = true;
                    }
                }
            }
        }
    }

    // Dropping the array closes every socket exactly once.
    drop(socks);
    let mut running = flag.running.lock();
    *running = false;
    flag.cond.notify_all();
    debug!("listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_port_wraps_to_application_port() {
        assert_eq!(next_port(50000), 50001);
        assert_eq!(next_port(u16::MAX), APPLICATION_LISTENING_PORT);
    }

    #[test]
    fn test_bind_listen_hunts_upward() {
        let (first, port) =
            bind_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), 0, false).expect("first bind");
        let (_second, second_port) =
            bind_listen(IpAddr::V4(Ipv4Addr::LOCALHOST), port, false).expect("second bind");
        assert!(second_port > port);
        drop(first);
    }
}
