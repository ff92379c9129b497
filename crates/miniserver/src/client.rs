use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use crate::builder::{MessageBuilder, Part};
use crate::error::{Error, Result};
use crate::headers::{HeaderId, Headers};
use crate::parser::{Method, ParsePos, ParseStatus, Parser, TransferMode};
use crate::sock::{Connection, Stream};
use crate::uri::Uri;

/// Body-length declaration for an outbound request. `Chunked` and
/// `UntilClose` correspond to the classic negative sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentLen {
    Len(u64),
    Chunked,
    UntilClose,
}

/// Entity delimitation reported for a received response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLength {
    Known(usize),
    Chunked,
    UntilClose,
    Empty,
}

pub struct ResponseMeta {
    pub status: u16,
    pub content_type: Option<String>,
    pub length: ResponseLength,
    /// Every response header, surfaced to the caller.
    pub headers: Headers,
}

/// Cloneable token that aborts an in-flight body read.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// An outbound HTTP/1.1 connection: request streaming out, response
/// streaming in.
pub struct HttpConnection {
    conn: Connection,
    response: Parser,
    request_started: bool,
    chunked_out: bool,
    cancel: Arc<AtomicBool>,
}

impl HttpConnection {
    /// Resolve the URL and connect (5 second bound). `https` URLs need a
    /// TLS stream from the OS layer, see [`HttpConnection::from_stream`].
    pub fn open(url: &str) -> Result<HttpConnection> {
        let uri = Uri::parse(url)?.fix();
        if uri.scheme == "https" {
            return Err(Error::InvalidUrl("https needs an external TLS stream"));
        }
        let addr = uri.addr().ok_or(Error::InvalidUrl("relative url"))?;
        let conn = Connection::connect(addr)?;
        Ok(HttpConnection::from_connection(conn))
    }

    /// Wrap an established (possibly TLS) stream.
    pub fn from_stream(stream: Box<dyn Stream>, peer: std::net::SocketAddr) -> HttpConnection {
        HttpConnection::from_connection(Connection::from_stream(stream, peer))
    }

    fn from_connection(conn: Connection) -> HttpConnection {
        HttpConnection {
            conn,
            response: Parser::new_response(Method::Get),
            request_started: false,
            chunked_out: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    /// Send the request line and headers. The body, if any, follows via
    /// [`HttpConnection::write_body`].
    pub fn make_request(
        &mut self,
        method: Method,
        url: &str,
        extra_headers: &[(String, String)],
        content_type: Option<&str>,
        content_length: ContentLen,
        timeout: Duration,
    ) -> Result<()> {
        let uri = Uri::parse(url)?.fix();
        let mut parts = vec![Part::RequestLineWithHost(method, &uri)];
        if !extra_headers.is_empty() {
            parts.push(Part::ExtraHeaders(extra_headers));
        }
        if let Some(ct) = content_type {
            parts.push(Part::ContentType(ct));
        }
        match content_length {
            ContentLen::Len(n) => parts.push(Part::ContentLength(n)),
            ContentLen::Chunked => parts.push(Part::TransferEncodingChunked),
            ContentLen::UntilClose => {}
        }
        parts.push(Part::Crlf);
        let buf = MessageBuilder::new(1, 1).build(&parts)?;
        trace!(url, method = method.as_str(), "sending request");
        self.conn.write_all(&buf, timeout)?;
        self.chunked_out = content_length == ContentLen::Chunked;
        self.request_started = true;
        self.cancel.store(false, Ordering::SeqCst);
        self.response = Parser::new_response(method);
        Ok(())
    }

    /// Write body bytes; in chunked mode every call becomes one chunk.
    pub fn write_body(&mut self, body: &[u8], timeout: Duration) -> Result<usize> {
        if body.is_empty() {
            return Ok(0);
        }
        if self.chunked_out {
            let header = format!("{:x}\r\n", body.len());
            self.conn.write_all(header.as_bytes(), timeout)?;
            self.conn.write_all(body, timeout)?;
            self.conn.write_all(b"\r\n", timeout)?;
        } else {
            self.conn.write_all(body, timeout)?;
        }
        Ok(body.len())
    }

    /// Terminate the request body (the final chunk in chunked mode).
    pub fn end_request(&mut self, timeout: Duration) -> Result<()> {
        if !self.request_started {
            return Ok(());
        }
        self.request_started = false;
        if self.chunked_out {
            self.conn.write_all(b"0\r\n\r\n", timeout)?;
        }
        Ok(())
    }

    /// Read the status line and headers of the response.
    pub fn read_response_meta(&mut self, timeout: Duration) -> Result<ResponseMeta> {
        let mut chunk = [0u8; 2048];
        while !matches!(
            self.response.position(),
            ParsePos::Entity | ParsePos::Complete
        ) {
            let n = self.conn.read(&mut chunk, timeout)?;
            if n == 0 {
                return Err(Error::BadResponse);
            }
            match self.response.append(&chunk[..n]) {
                ParseStatus::NoMatch | ParseStatus::Failure => return Err(Error::BadResponse),
                _ => {}
            }
        }
        let msg = &self.response.msg;
        let length = match msg.transfer {
            TransferMode::None => ResponseLength::Empty,
            TransferMode::Chunked => ResponseLength::Chunked,
            TransferMode::ContentLength(n) => ResponseLength::Known(n),
            TransferMode::UntilClose => ResponseLength::UntilClose,
        };
        Ok(ResponseMeta {
            status: msg.status_code,
            content_type: msg
                .headers
                .get_str(HeaderId::ContentType)
                .map(str::to_owned),
            length,
            headers: msg.headers.clone(),
        })
    }

    /// Read decoded body bytes. Already-buffered bytes are served first;
    /// the socket is read only as needed. Observes [`CancelHandle`] between
    /// read iterations.
    pub fn read_response_body(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.response.parse_entity() {
            ParseStatus::NoMatch | ParseStatus::Failure => return Err(Error::BadResponse),
            _ => {}
        }
        let mut chunk = [0u8; 2048];
        while self.response.msg.entity_len < buf.len()
            && !self.cancel.load(Ordering::SeqCst)
            && self.response.position() != ParsePos::Complete
        {
            let n = self.conn.read(&mut chunk, timeout)?;
            if n == 0 {
                match self.response.eof() {
                    ParseStatus::Ok => break,
                    _ => return Err(Error::BadHttpMsg),
                }
            }
            self.response.append_bytes(&chunk[..n]);
            match self.response.parse_entity() {
                ParseStatus::NoMatch | ParseStatus::Failure => return Err(Error::BadResponse),
                _ => {}
            }
        }
        if self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }
        Ok(self.response.take_entity(buf))
    }

    /// (bytes received so far, declared total). The total is 0 when the
    /// length is not known up front.
    pub fn progress(&self) -> (usize, usize) {
        (self.response.entity_total(), self.response.msg.content_length)
    }

    /// Half-close both directions and free the handle.
    pub fn close(mut self) {
        self.conn.shutdown();
    }
}

/// One-shot GET returning the whole entity and its content type.
pub fn download(url: &str, timeout: Duration) -> Result<(Vec<u8>, Option<String>)> {
    let mut handle = HttpConnection::open(url)?;
    let uri = Uri::parse(url)?.fix();
    let buf = MessageBuilder::new(1, 1).build(&[
        Part::RequestLineWithHost(Method::Get, &uri),
        Part::DateNow,
        Part::ConnectionClose,
        Part::UserAgent,
        Part::Crlf,
    ])?;
    handle.conn.write_all(&buf, timeout)?;
    handle.response = Parser::new_response(Method::Get);

    let meta = handle.read_response_meta(timeout)?;
    if meta.status != 200 {
        debug!(status = meta.status, url, "download rejected");
        return Err(Error::BadResponse);
    }
    let mut body = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = handle.read_response_body(&mut chunk, timeout)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok((body, meta.content_type))
}

/// GET with a `Range: bytes=lo-hi` header. Returns the open handle and the
/// parsed response meta; the body is streamed by the caller.
pub fn open_get_ex(
    url: &str,
    lo: u64,
    hi: u64,
    timeout: Duration,
) -> Result<(HttpConnection, ResponseMeta)> {
    let mut handle = HttpConnection::open(url)?;
    let range = [("Range".to_owned(), format!("bytes={lo}-{hi}"))];
    handle.make_request(
        Method::Get,
        url,
        &range,
        None,
        ContentLen::UntilClose,
        timeout,
    )?;
    let meta = handle.read_response_meta(timeout)?;
    Ok((handle, meta))
}

/// Connect, send one request with an optional body, and read the whole
/// response.
pub fn request_and_response(
    method: Method,
    url: &str,
    body: Option<(&str, &[u8])>,
    timeout: Duration,
) -> Result<(ResponseMeta, Vec<u8>)> {
    let mut handle = HttpConnection::open(url)?;
    let (content_type, payload) = match body {
        Some((ct, payload)) => (Some(ct), payload),
        None => (None, &[][..]),
    };
    handle.make_request(
        method,
        url,
        &[],
        content_type,
        ContentLen::Len(payload.len() as u64),
        timeout,
    )?;
    handle.write_body(payload, timeout)?;
    handle.end_request(timeout)?;
    let meta = handle.read_response_meta(timeout)?;
    let mut response_body = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = handle.read_response_body(&mut chunk, timeout)?;
        if n == 0 {
            break;
        }
        response_body.extend_from_slice(&chunk[..n]);
    }
    Ok((meta, response_body))
}
