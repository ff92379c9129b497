use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::headers::HeaderId;
use crate::parser::{Method, ParseStatus, Parser};
use crate::sock::Connection;
use crate::state::{RequestContext, ServerState};
use crate::uri::split_hostport;
use crate::webserver::send_status_response;

/// Read request headers off the wire. `Err(Some(code))` asks the caller to
/// answer with that status; `Err(None)` means the connection is unusable.
fn recv_message(
    conn: &mut Connection,
    parser: &mut Parser,
    timeout: Duration,
    max_content_length: usize,
) -> Result<(), Option<u16>> {
    let mut chunk = [0u8; 2048];
    let mut ok_on_close = false;
    loop {
        let n = match conn.read(&mut chunk, timeout) {
            Ok(n) => n,
            Err(Error::Timeout) => return Err(Some(408)),
            Err(_) => return Err(None),
        };
        if n == 0 {
            if ok_on_close && parser.eof() == ParseStatus::Ok {
                return Ok(());
            }
            // Truncated message.
            return Err(Some(400));
        }
        let status = parser.append(&chunk[..n]);
        let too_large = max_content_length > 0
            && (parser.msg.content_length > max_content_length
                || parser.entity_total() > max_content_length);
        match status {
            ParseStatus::Ok | ParseStatus::Continue1 => {
                if too_large {
                    return Err(Some(413));
                }
                return Ok(());
            }
            ParseStatus::Incomplete => {
                if too_large {
                    return Err(Some(413));
                }
            }
            ParseStatus::IncompleteEntity => ok_on_close = true,
            ParseStatus::NoMatch => {
                let code = if parser.http_error_code == 0 {
                    400
                } else {
                    parser.http_error_code
                };
                return Err(Some(code));
            }
            ParseStatus::Failure => return Err(Some(500)),
        }
    }
}

/// The literal host must be a numeric IPv4 or bracketed IPv6 address, with
/// an optional port.
fn host_header_is_numeric(host_port: &str) -> bool {
    match split_hostport(host_port) {
        Some((host, _)) => host.parse::<IpAddr>().is_ok(),
        None => false,
    }
}

fn send_numeric_redirect(conn: &mut Connection, timeout: Duration) {
    let Ok(local) = conn.local_addr() else {
        return;
    };
    let response = format!(
        "HTTP/1.1 307 Temporary Redirect\r\nLocation: http://{local}/\r\n\r\n"
    );
    let _ = conn.write_all(response.as_bytes(), timeout);
}

/// Route the parsed request to its protocol handler. SOAP wins `POST` when
/// registered; the web server gets it otherwise.
fn dispatch_request(
    state: &Arc<ServerState>,
    parser: &mut Parser,
    conn: &mut Connection,
) -> Result<(), u16> {
    let method = parser.msg.method;
    let (callback, is_web) = match method {
        Method::MPost => (state.soap_handler(), false),
        Method::Post => match state.soap_handler() {
            Some(soap) => (Some(soap), false),
            None => (state.web_handler(), true),
        },
        Method::Notify | Method::Subscribe | Method::Unsubscribe => (state.gena_handler(), false),
        Method::Get | Method::Head | Method::SimpleGet => (state.web_handler(), true),
        Method::Unknown => (None, false),
    };
    let Some(callback) = callback else {
        return Err(500);
    };
    debug!(peer = %conn.peer, method = method.as_str(), "dispatching request");

    // Check the HOST header for an IP number, preventing DNS rebinding.
    // HTTP/0.9 simple requests predate the Host header and are exempt.
    if method != Method::SimpleGet {
        let Some(host) = parser.msg.headers.get_str(HeaderId::Host).map(str::to_owned) else {
            return Err(400);
        };
        let validator = if is_web {
            state.host_validate_handler()
        } else {
            None
        };
        if let Some(validator) = validator {
            if let Err(e) = validator.validate(&host) {
                debug!(host, "host rejected by validator: {e:#}");
                return Err(400);
            }
        } else if !host_header_is_numeric(&host) {
            if !state.config.allow_literal_host_redirection {
                info!("Possible DNS Rebind attack prevented.");
                return Err(400);
            }
            send_numeric_redirect(conn, state.config.timeout);
            return Ok(());
        }
    }

    let mut ctx = RequestContext {
        parser,
        conn,
        state,
    };
    if let Err(e) = callback.handle(&mut ctx) {
        warn!("request handler failed: {e:#}");
        return Err(500);
    }
    Ok(())
}

/// Worker-side entry: read, dispatch, respond, tear down. Scheduled at MED
/// priority for every accepted connection.
pub fn handle_request(state: Arc<ServerState>, mut conn: Connection) {
    debug!(peer = %conn.peer, "miniserver: READING");
    let timeout = state.config.timeout;
    let mut parser = Parser::new_request();
    match recv_message(
        &mut conn,
        &mut parser,
        timeout,
        state.config.max_content_length,
    ) {
        Ok(()) => {
            let (major, minor) = (parser.msg.major, parser.msg.minor);
            if let Err(code) = dispatch_request(&state, &mut parser, &mut conn) {
                send_status_response(&mut conn, code.into(), major, minor, timeout);
            }
        }
        Err(Some(code)) => {
            send_status_response(
                &mut conn,
                code.into(),
                parser.msg.major,
                parser.msg.minor,
                timeout,
            );
        }
        Err(None) => {}
    }
    conn.shutdown();
    debug!(peer = %conn.peer, "miniserver: COMPLETE");
}
