// Method routing: SOAP wins POST when registered, GENA gets the eventing
// verbs, everything unroutable is a 500.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use upnp_miniserver::{Config, MiniServer, RequestContext, RequestHandler};

struct RecordingHandler {
    name: &'static str,
    bodies: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RequestHandler for RecordingHandler {
    fn handle(&self, ctx: &mut RequestContext<'_>) -> anyhow::Result<()> {
        let body = ctx.read_entity()?;
        self.bodies.lock().push((self.name.to_owned(), body));
        let response = b"HTTP/1.1 200 OK\r\nCONTENT-LENGTH: 0\r\nCONNECTION: close\r\n\r\n";
        ctx.conn.write_all(response, ctx.state.config.timeout)?;
        Ok(())
    }
}

fn response_text(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[test]
fn test_soap_wins_post_when_registered() {
    let server = MiniServer::start(Config::default()).unwrap();
    let port = server.ports().port4;
    let bodies = Arc::new(Mutex::new(Vec::new()));
    server
        .state()
        .set_soap_handler(Some(Arc::new(RecordingHandler {
            name: "soap",
            bodies: bodies.clone(),
        })));

    let text = response_text(
        port,
        &format!(
            "POST /control HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: 7\r\n\r\n<soap/>"
        ),
    );
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    let recorded = bodies.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].0, "soap");
    assert_eq!(recorded[0].1, b"<soap/>");

    server.stop().unwrap();
}

#[test]
fn test_gena_gets_eventing_verbs() {
    let server = MiniServer::start(Config::default()).unwrap();
    let port = server.ports().port4;
    let bodies = Arc::new(Mutex::new(Vec::new()));
    server
        .state()
        .set_gena_handler(Some(Arc::new(RecordingHandler {
            name: "gena",
            bodies: bodies.clone(),
        })));

    let notify = response_text(
        port,
        &format!(
            "NOTIFY /event HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nNT: upnp:event\r\nNTS: upnp:propchange\r\nContent-Length: 4\r\n\r\nwxyz"
        ),
    );
    assert!(notify.starts_with("HTTP/1.1 200 OK\r\n"), "{notify}");

    let subscribe = response_text(
        port,
        &format!(
            "SUBSCRIBE /event HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nCallback: <http://127.0.0.1:9/cb>\r\nNT: upnp:event\r\n\r\n"
        ),
    );
    assert!(subscribe.starts_with("HTTP/1.1 200 OK\r\n"), "{subscribe}");

    let recorded = bodies.lock();
    assert_eq!(recorded.len(), 2);
    assert_eq!(recorded[0].1, b"wxyz");
    assert_eq!(recorded[1].1, b"");

    server.stop().unwrap();
}

#[test]
fn test_unroutable_methods_get_500() {
    let server = MiniServer::start(Config::default()).unwrap();
    let port = server.ports().port4;

    // No GENA handler registered.
    let text = response_text(
        port,
        &format!("SUBSCRIBE /event HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"),
    );
    assert!(
        text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
        "{text}"
    );

    // M-POST routes to SOAP only; none is registered.
    let text = response_text(
        port,
        &format!(
            "M-POST /control HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nContent-Length: 0\r\n\r\n"
        ),
    );
    assert!(
        text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"),
        "{text}"
    );

    server.stop().unwrap();
}
