// Listener lifecycle: stop sentinel handling and port selection.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use upnp_miniserver::config::APPLICATION_LISTENING_PORT;
use upnp_miniserver::{Config, MiniServer};

#[test]
fn test_ports_are_reported() {
    let server = MiniServer::start(Config::default()).unwrap();
    let ports = server.ports();
    assert!(ports.port4 >= APPLICATION_LISTENING_PORT);
    assert_ne!(ports.stop_port, 0);
    assert!(server.is_running());
    server.stop().unwrap();
}

#[test]
fn test_stop_terminates_within_a_second() {
    let server = MiniServer::start(Config::default()).unwrap();
    let start = Instant::now();
    server.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_wrong_sentinel_does_not_stop() {
    let server = MiniServer::start(Config::default()).unwrap();
    let stop_port = server.ports().stop_port;
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();

    // Close but not exact: missing NUL, wrong case, trailing junk.
    for payload in [&b"ShutDown"[..], b"shutdown\0", b"ShutDown\0x"] {
        sock.send_to(payload, ("127.0.0.1", stop_port)).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    assert!(server.is_running());

    server.stop().unwrap();
}

#[test]
fn test_two_servers_pick_distinct_ports() {
    let a = MiniServer::start(Config::default()).unwrap();
    let b = MiniServer::start(Config::default()).unwrap();
    assert_ne!(a.ports().port4, b.ports().port4);
    b.stop().unwrap();
    a.stop().unwrap();
}

#[test]
fn test_requested_port_hint_is_honored() {
    // Pick a port that is almost certainly free by binding and releasing.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let hint = probe.local_addr().unwrap().port();
    drop(probe);

    let server = MiniServer::start_with_ports(Config::default(), hint, 0, 0).unwrap();
    assert_eq!(server.ports().port4, hint);
    server.stop().unwrap();
}
