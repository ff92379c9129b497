use bstr::BStr;
use memchr::memchr;
use tracing::trace;

use crate::headers::{HeaderId, Headers, value_contains};
use crate::uri::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    MPost,
    Subscribe,
    Unsubscribe,
    Notify,
    SimpleGet,
    Unknown,
}

impl Method {
    pub fn from_token(token: &[u8]) -> Method {
        match token {
            b"GET" => Method::Get,
            b"HEAD" => Method::Head,
            b"POST" => Method::Post,
            b"M-POST" => Method::MPost,
            b"SUBSCRIBE" => Method::Subscribe,
            b"UNSUBSCRIBE" => Method::Unsubscribe,
            b"NOTIFY" => Method::Notify,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get | Method::SimpleGet => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::MPost => "M-POST",
            Method::Subscribe => "SUBSCRIBE",
            Method::Unsubscribe => "UNSUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Unknown => "UNKNOWN",
        }
    }
}

/// How the entity is delimited on the wire. Resolved exactly once after the
/// headers, with the HTTP/1.1 priority chunked > content-length > until-close
/// (responses only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    None,
    ContentLength(usize),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsePos {
    ReqLine,
    RespLine,
    Headers,
    Entity,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The message is complete.
    Ok,
    /// More bytes are needed.
    Incomplete,
    /// Read-until-close entity; bytes are still welcome, EOF terminates.
    IncompleteEntity,
    /// Malformed input.
    NoMatch,
    /// Internal failure.
    Failure,
    /// Headers are done; the entity is left for the handler to stream.
    Continue1,
}

#[derive(Debug)]
pub struct HttpMessage {
    pub is_request: bool,
    pub method: Method,
    pub uri: Option<Uri>,
    pub major: u8,
    pub minor: u8,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    /// Offset of the (decoded) entity inside the receive buffer.
    pub entity_start: usize,
    /// Decoded entity bytes currently present in the buffer.
    pub entity_len: usize,
    pub transfer: TransferMode,
    pub content_length: usize,
    /// Entity bytes already surfaced to the caller and dropped from the
    /// buffer.
    pub amount_discarded: usize,
    /// A chunked trailer block was present (its fields are ignored).
    pub saw_trailers: bool,
}

impl HttpMessage {
    fn new(is_request: bool) -> HttpMessage {
        HttpMessage {
            is_request,
            method: Method::Unknown,
            uri: None,
            major: 1,
            minor: 1,
            status_code: 0,
            reason: String::new(),
            headers: Headers::new(),
            entity_start: 0,
            entity_len: 0,
            transfer: TransferMode::None,
            content_length: 0,
            amount_discarded: 0,
            saw_trailers: false,
        }
    }

    pub fn is_http_1_1_or_greater(&self) -> bool {
        self.major > 1 || (self.major == 1 && self.minor >= 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data,
    DataCrlf,
    Trailers,
}

/// Restartable incremental parser over one receive buffer. The position only
/// advances; `Incomplete` means more bytes may be appended and parsing
/// re-entered with no loss of prior work.
#[derive(Debug)]
pub struct Parser {
    pub msg: HttpMessage,
    buf: Vec<u8>,
    pos: ParsePos,
    scanner: usize,
    chunk_phase: ChunkPhase,
    chunk_remaining: usize,
    continue1_returned: bool,
    /// Request method a response parser is paired with (HEAD responses have
    /// no body).
    request_method: Method,
    pub http_error_code: u16,
}

const CRLF: &[u8] = b"\r\n";

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let mut at = from;
    while let Some(i) = memchr(b'\n', &buf[at..]) {
        let nl = at + i;
        if nl > from && buf[nl - 1] == b'\r' {
            return Some(nl - 1);
        }
        at = nl + 1;
    }
    None
}

impl Parser {
    pub fn new_request() -> Parser {
        Parser {
            msg: HttpMessage::new(true),
            buf: Vec::new(),
            pos: ParsePos::ReqLine,
            scanner: 0,
            chunk_phase: ChunkPhase::Size,
            chunk_remaining: 0,
            continue1_returned: false,
            request_method: Method::Unknown,
            http_error_code: 0,
        }
    }

    pub fn new_response(request_method: Method) -> Parser {
        Parser {
            msg: HttpMessage::new(false),
            buf: Vec::new(),
            pos: ParsePos::RespLine,
            scanner: 0,
            chunk_phase: ChunkPhase::Size,
            chunk_remaining: 0,
            continue1_returned: false,
            request_method,
            http_error_code: 0,
        }
    }

    pub fn position(&self) -> ParsePos {
        self.pos
    }

    pub fn buffer_len(&self) -> usize {
        self.buf.len()
    }

    /// Decoded entity bytes currently held in the buffer.
    pub fn entity(&self) -> &[u8] {
        &self.buf[self.msg.entity_start..self.msg.entity_start + self.msg.entity_len]
    }

    pub fn append(&mut self, bytes: &[u8]) -> ParseStatus {
        self.buf.extend_from_slice(bytes);
        self.parse()
    }

    /// Append without re-entering the parser, for callers driving
    /// `parse_entity` themselves.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn parse(&mut self) -> ParseStatus {
        loop {
            let status = match self.pos {
                ParsePos::ReqLine => self.parse_request_line(),
                ParsePos::RespLine => self.parse_response_line(),
                ParsePos::Headers => self.parse_headers(),
                ParsePos::Entity => return self.parse_entity(),
                ParsePos::Complete => return ParseStatus::Ok,
            };
            match status {
                // A phase finished; fall through to the next one.
                ParseStatus::Ok if self.pos != ParsePos::Complete => continue,
                other => return other,
            }
        }
    }

    fn no_match(&mut self, code: u16) -> ParseStatus {
        self.http_error_code = code;
        ParseStatus::NoMatch
    }

    fn parse_request_line(&mut self) -> ParseStatus {
        // Tolerate empty line(s) before the request line.
        while self.buf[self.scanner..].starts_with(CRLF) {
            self.scanner += 2;
        }
        let Some(eol) = find_crlf(&self.buf, self.scanner) else {
            return ParseStatus::Incomplete;
        };
        let line = self.buf[self.scanner..eol].to_vec();
        let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
        let (method, uri, version) = (parts.next(), parts.next(), parts.next());
        if parts.next().is_some() {
            return self.no_match(400);
        }
        match (method, uri, version) {
            (Some(m), Some(u), Some(v)) => {
                self.msg.method = Method::from_token(m);
                let Some((major, minor)) = parse_http_version(v) else {
                    return self.no_match(400);
                };
                self.msg.major = major;
                self.msg.minor = minor;
                let Ok(u) = std::str::from_utf8(u) else {
                    return self.no_match(400);
                };
                match Uri::parse(u) {
                    Ok(uri) => self.msg.uri = Some(uri.fix()),
                    Err(_) => return self.no_match(400),
                }
                self.scanner = eol + 2;
                self.pos = ParsePos::Headers;
                ParseStatus::Ok
            }
            // HTTP/0.9 style "GET <url>", no version, no headers.
            (Some(b"GET"), Some(u), None) => {
                self.msg.method = Method::SimpleGet;
                self.msg.major = 0;
                self.msg.minor = 9;
                let Ok(u) = std::str::from_utf8(u) else {
                    return self.no_match(400);
                };
                match Uri::parse(u) {
                    Ok(uri) => self.msg.uri = Some(uri.fix()),
                    Err(_) => return self.no_match(400),
                }
                self.scanner = eol + 2;
                self.pos = ParsePos::Complete;
                ParseStatus::Ok
            }
            _ => self.no_match(400),
        }
    }

    fn parse_response_line(&mut self) -> ParseStatus {
        while self.buf[self.scanner..].starts_with(CRLF) {
            self.scanner += 2;
        }
        let Some(eol) = find_crlf(&self.buf, self.scanner) else {
            return ParseStatus::Incomplete;
        };
        let line = self.buf[self.scanner..eol].to_vec();
        let mut parts = line.splitn(3, |&b| b == b' ');
        let (version, status) = (parts.next(), parts.next());
        let reason = parts.next().unwrap_or(b"");
        let (Some(v), Some(status)) = (version, status) else {
            return self.no_match(400);
        };
        let Some((major, minor)) = parse_http_version(v) else {
            return self.no_match(400);
        };
        let Some(code) = std::str::from_utf8(status)
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        else {
            return self.no_match(400);
        };
        self.msg.major = major;
        self.msg.minor = minor;
        self.msg.status_code = code;
        self.msg.reason = String::from_utf8_lossy(reason).into_owned();
        self.scanner = eol + 2;
        self.pos = ParsePos::Headers;
        ParseStatus::Ok
    }

    fn parse_headers(&mut self) -> ParseStatus {
        loop {
            let Some(eol) = find_crlf(&self.buf, self.scanner) else {
                return ParseStatus::Incomplete;
            };
            if eol == self.scanner {
                // Empty line terminates the headers.
                self.scanner = eol + 2;
                return self.determine_entity();
            }
            // The logical line only ends once we can see that the next line
            // does not start with whitespace (folded continuation).
            let mut segments = vec![(self.scanner, eol)];
            let mut logical_end = eol;
            loop {
                if self.buf.len() <= logical_end + 2 {
                    return ParseStatus::Incomplete;
                }
                let next = self.buf[logical_end + 2];
                if next == b' ' || next == b'\t' {
                    let Some(cont_eol) = find_crlf(&self.buf, logical_end + 2) else {
                        return ParseStatus::Incomplete;
                    };
                    segments.push((logical_end + 2, cont_eol));
                    logical_end = cont_eol;
                } else {
                    break;
                }
            }
            let (first_start, first_end) = segments[0];
            let first = &self.buf[first_start..first_end];
            let Some(colon) = memchr(b':', first) else {
                trace!(line = ?BStr::new(first), "header line without colon");
                return self.no_match(400);
            };
            let name = trim_bytes(&first[..colon]).to_vec();
            if name.is_empty() {
                return self.no_match(400);
            }
            let mut value = trim_bytes(&first[colon + 1..]).to_vec();
            for &(s, e) in &segments[1..] {
                let cont = trim_bytes(&self.buf[s..e]);
                if !cont.is_empty() {
                    if !value.is_empty() {
                        value.push(b' ');
                    }
                    value.extend_from_slice(cont);
                }
            }
            self.msg.headers.add(&name, &value);
            self.scanner = logical_end + 2;
        }
    }

    fn determine_entity(&mut self) -> ParseStatus {
        let chunked = self
            .msg
            .headers
            .get(HeaderId::TransferEncoding)
            .map(|v| value_contains(v, "chunked"))
            .unwrap_or(false);
        let content_length = match self.msg.headers.get(HeaderId::ContentLength) {
            Some(v) => match std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
            {
                Some(len) => Some(len),
                None => return self.no_match(400),
            },
            None => None,
        };

        self.msg.transfer =
            if !self.msg.is_request && response_has_no_body(&self.msg, self.request_method) {
                TransferMode::None
            } else if chunked {
                TransferMode::Chunked
            } else if let Some(len) = content_length {
                self.msg.content_length = len;
                TransferMode::ContentLength(len)
            } else if !self.msg.is_request {
                TransferMode::UntilClose
            } else {
                TransferMode::None
            };

        self.msg.entity_start = self.scanner;
        self.pos = ParsePos::Entity;

        // The web server streams request POST entities itself; 100-continue
        // likewise leaves the entity to the handler.
        if self.msg.is_request && !self.continue1_returned {
            let expects_continue = self
                .msg
                .headers
                .get(HeaderId::Expect)
                .map(|v| value_contains(v, "100-continue"))
                .unwrap_or(false);
            if self.msg.method == Method::Post || expects_continue {
                self.continue1_returned = true;
                return ParseStatus::Continue1;
            }
        }
        ParseStatus::Ok
    }

    fn cursor(&self) -> usize {
        self.msg.entity_start + self.msg.entity_len
    }

    pub fn parse_entity(&mut self) -> ParseStatus {
        if self.pos == ParsePos::Complete {
            return ParseStatus::Ok;
        }
        if self.pos != ParsePos::Entity {
            return ParseStatus::Failure;
        }
        match self.msg.transfer {
            TransferMode::None => {
                self.pos = ParsePos::Complete;
                ParseStatus::Ok
            }
            TransferMode::ContentLength(total) => {
                let have = self.buf.len() - self.msg.entity_start;
                let want = total - self.msg.amount_discarded;
                self.msg.entity_len = have.min(want);
                if self.msg.amount_discarded + self.msg.entity_len == total {
                    self.pos = ParsePos::Complete;
                    ParseStatus::Ok
                } else {
                    ParseStatus::Incomplete
                }
            }
            TransferMode::UntilClose => {
                self.msg.entity_len = self.buf.len() - self.msg.entity_start;
                ParseStatus::IncompleteEntity
            }
            TransferMode::Chunked => self.parse_chunks(),
        }
    }

    fn parse_chunks(&mut self) -> ParseStatus {
        loop {
            match self.chunk_phase {
                ChunkPhase::Size => {
                    let cursor = self.cursor();
                    let Some(eol) = find_crlf(&self.buf, cursor) else {
                        return ParseStatus::Incomplete;
                    };
                    let line = &self.buf[cursor..eol];
                    // Chunk extensions after ';' are ignored.
                    let size_part = match memchr(b';', line) {
                        Some(i) => &line[..i],
                        None => line,
                    };
                    let Some(size) = parse_hex(trim_bytes(size_part)) else {
                        trace!(line = ?BStr::new(line), "bad chunk size line");
                        return self.no_match(400);
                    };
                    self.buf.drain(cursor..eol + 2);
                    if size == 0 {
                        self.chunk_phase = ChunkPhase::Trailers;
                    } else {
                        self.chunk_remaining = size;
                        self.chunk_phase = ChunkPhase::Data;
                    }
                }
                ChunkPhase::Data => {
                    let avail = self.buf.len() - self.cursor();
                    let take = avail.min(self.chunk_remaining);
                    self.msg.entity_len += take;
                    self.chunk_remaining -= take;
                    if self.chunk_remaining > 0 {
                        return ParseStatus::Incomplete;
                    }
                    self.chunk_phase = ChunkPhase::DataCrlf;
                }
                ChunkPhase::DataCrlf => {
                    let cursor = self.cursor();
                    if self.buf.len() < cursor + 2 {
                        return ParseStatus::Incomplete;
                    }
                    if &self.buf[cursor..cursor + 2] != CRLF {
                        return self.no_match(400);
                    }
                    self.buf.drain(cursor..cursor + 2);
                    self.chunk_phase = ChunkPhase::Size;
                }
                ChunkPhase::Trailers => {
                    let cursor = self.cursor();
                    let Some(eol) = find_crlf(&self.buf, cursor) else {
                        return ParseStatus::Incomplete;
                    };
                    if eol == cursor {
                        self.buf.drain(cursor..cursor + 2);
                        self.pos = ParsePos::Complete;
                        return ParseStatus::Ok;
                    }
                    self.msg.saw_trailers = true;
                    self.buf.drain(cursor..eol + 2);
                }
            }
        }
    }

    /// EOF seen on the connection. Finishes an until-close entity; anything
    /// else is a truncated message.
    pub fn eof(&mut self) -> ParseStatus {
        match (self.pos, self.msg.transfer) {
            (ParsePos::Complete, _) => ParseStatus::Ok,
            (ParsePos::Entity, TransferMode::UntilClose) => {
                self.pos = ParsePos::Complete;
                ParseStatus::Ok
            }
            _ => self.no_match(400),
        }
    }

    /// Move up to `out.len()` decoded entity bytes to the caller, dropping
    /// them from the receive buffer.
    pub fn take_entity(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.msg.entity_len);
        if n == 0 {
            return 0;
        }
        let start = self.msg.entity_start;
        out[..n].copy_from_slice(&self.buf[start..start + n]);
        self.buf.drain(start..start + n);
        self.msg.entity_len -= n;
        self.msg.amount_discarded += n;
        n
    }

    /// Total decoded entity bytes seen so far (surfaced plus buffered).
    pub fn entity_total(&self) -> usize {
        self.msg.amount_discarded + self.msg.entity_len
    }
}

fn response_has_no_body(msg: &HttpMessage, request_method: Method) -> bool {
    request_method == Method::Head
        || msg.status_code / 100 == 1
        || msg.status_code == 204
        || msg.status_code == 304
}

fn parse_http_version(token: &[u8]) -> Option<(u8, u8)> {
    let rest = token.strip_prefix(b"HTTP/")?;
    let s = std::str::from_utf8(rest).ok()?;
    let (major, minor) = s.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn parse_hex(bytes: &[u8]) -> Option<usize> {
    if bytes.is_empty() || bytes.len() > 16 {
        return None;
    }
    let mut v: usize = 0;
    for &b in bytes {
        let d = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return None,
        };
        v = v.checked_mul(16)?.checked_add(d as usize)?;
    }
    Some(v)
}

fn trim_bytes(b: &[u8]) -> &[u8] {
    let start = b.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(b.len());
    let end = b.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &b[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Parser, bytes: &[u8]) -> ParseStatus {
        parser.append(bytes)
    }

    fn feed_one_by_one(parser: &mut Parser, bytes: &[u8]) -> ParseStatus {
        let mut last = ParseStatus::Incomplete;
        for b in bytes {
            last = parser.append(std::slice::from_ref(b));
        }
        last
    }

    const GET_REQ: &[u8] = b"GET /hello.txt HTTP/1.1\r\nHost: 127.0.0.1:49152\r\nUser-Agent: test\r\n\r\n";

    #[test]
    fn test_parse_get_request() {
        let mut p = Parser::new_request();
        assert_eq!(feed_all(&mut p, GET_REQ), ParseStatus::Ok);
        assert_eq!(p.msg.method, Method::Get);
        assert_eq!(p.msg.uri.as_ref().unwrap().pathquery, "/hello.txt");
        assert_eq!(p.msg.major, 1);
        assert_eq!(p.msg.minor, 1);
        assert_eq!(
            p.msg.headers.get(HeaderId::Host),
            Some(&b"127.0.0.1:49152"[..])
        );
        assert_eq!(p.msg.transfer, TransferMode::None);
    }

    #[test]
    fn test_byte_at_a_time_equals_all_at_once() {
        let mut whole = Parser::new_request();
        assert_eq!(feed_all(&mut whole, GET_REQ), ParseStatus::Ok);
        let mut split = Parser::new_request();
        assert_eq!(feed_one_by_one(&mut split, GET_REQ), ParseStatus::Ok);
        assert_eq!(whole.msg.headers.len(), split.msg.headers.len());
        assert_eq!(whole.msg.entity_start, split.msg.entity_start);
        assert_eq!(whole.msg.entity_len, split.msg.entity_len);
    }

    #[test]
    fn test_byte_at_a_time_chunked_response() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let mut whole = Parser::new_response(Method::Get);
        assert_eq!(feed_all(&mut whole, raw), ParseStatus::Ok);
        assert_eq!(whole.entity(), b"hello world");
        let mut split = Parser::new_response(Method::Get);
        assert_eq!(feed_one_by_one(&mut split, raw), ParseStatus::Ok);
        assert_eq!(split.entity(), b"hello world");
    }

    #[test]
    fn test_chunk_sizes_not_in_entity() {
        let raw = b"NOTIFY /cb HTTP/1.1\r\nHost: h:1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut p = Parser::new_request();
        assert_eq!(p.append(raw), ParseStatus::Ok);
        assert_eq!(p.entity(), b"abc");
        assert_eq!(p.msg.transfer, TransferMode::Chunked);
    }

    #[test]
    fn test_chunk_extension_and_trailers_ignored() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;ext=1\r\nabc\r\n";
        let mut p = Parser::new_response(Method::Get);
        assert_eq!(p.append(raw), ParseStatus::Incomplete);
        assert_eq!(p.append(b"0\r\nX-Trailer: v\r\n\r\n"), ParseStatus::Ok);
        assert!(p.msg.saw_trailers);
        assert_eq!(p.entity(), b"abc");
    }

    #[test]
    fn test_content_length_entity() {
        let raw = b"NOTIFY /cb HTTP/1.1\r\nHost: h:1\r\nContent-Length: 4\r\n\r\nabcd";
        let mut p = Parser::new_request();
        assert_eq!(p.append(raw), ParseStatus::Ok);
        assert_eq!(p.entity(), b"abcd");
        assert_eq!(p.msg.content_length, 4);
    }

    #[test]
    fn test_post_returns_continue1() {
        let raw = b"POST /up HTTP/1.1\r\nHost: h:1\r\nContent-Length: 5\r\n\r\n";
        let mut p = Parser::new_request();
        assert_eq!(p.append(raw), ParseStatus::Continue1);
        assert_eq!(p.append(b"hello"), ParseStatus::Ok);
        assert_eq!(p.entity(), b"hello");
    }

    #[test]
    fn test_chunked_post_streams() {
        let mut p = Parser::new_request();
        let head = b"POST /vdir/upload HTTP/1.1\r\nHost: h:1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(p.append(head), ParseStatus::Continue1);
        assert_eq!(p.append(b"5\r\nhello\r\n"), ParseStatus::Incomplete);
        assert_eq!(p.entity(), b"hello");
        assert_eq!(p.append(b"0\r\n\r\n"), ParseStatus::Ok);
    }

    #[test]
    fn test_simple_get() {
        let mut p = Parser::new_request();
        assert_eq!(p.append(b"GET /index.html\r\n"), ParseStatus::Ok);
        assert_eq!(p.msg.method, Method::SimpleGet);
        assert_eq!(p.msg.major, 0);
        assert_eq!(p.msg.minor, 9);
    }

    #[test]
    fn test_response_until_close() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\npartial";
        let mut p = Parser::new_response(Method::Get);
        assert_eq!(p.append(raw), ParseStatus::IncompleteEntity);
        assert_eq!(p.append(b" more"), ParseStatus::IncompleteEntity);
        assert_eq!(p.eof(), ParseStatus::Ok);
        assert_eq!(p.entity(), b"partial more");
    }

    #[test]
    fn test_head_response_has_no_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n";
        let mut p = Parser::new_response(Method::Head);
        assert_eq!(p.append(raw), ParseStatus::Ok);
        assert_eq!(p.msg.transfer, TransferMode::None);
    }

    #[test]
    fn test_transfer_encoding_beats_content_length() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 999\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
        let mut p = Parser::new_response(Method::Get);
        assert_eq!(p.append(raw), ParseStatus::Ok);
        assert_eq!(p.entity(), b"hi");
    }

    #[test]
    fn test_malformed_request_line() {
        let mut p = Parser::new_request();
        assert_eq!(p.append(b"NONSENSE\r\n\r\n"), ParseStatus::NoMatch);
        assert_eq!(p.http_error_code, 400);
    }

    #[test]
    fn test_bad_chunk_size() {
        let raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut p = Parser::new_response(Method::Get);
        assert_eq!(p.append(raw), ParseStatus::NoMatch);
    }

    #[test]
    fn test_folded_header() {
        let raw = b"GET / HTTP/1.1\r\nHost: h:1\r\nX-Long: part1\r\n part2\r\n\r\n";
        let mut p = Parser::new_request();
        assert_eq!(p.append(raw), ParseStatus::Ok);
        assert_eq!(p.msg.headers.get_named(b"x-long"), Some(&b"part1 part2"[..]));
    }

    #[test]
    fn test_take_entity_updates_discarded() {
        let raw = b"NOTIFY /cb HTTP/1.1\r\nHost: h:1\r\nContent-Length: 6\r\n\r\nabc";
        let mut p = Parser::new_request();
        assert_eq!(p.append(raw), ParseStatus::Incomplete);
        let mut out = [0u8; 2];
        assert_eq!(p.take_entity(&mut out), 2);
        assert_eq!(&out, b"ab");
        assert_eq!(p.msg.amount_discarded, 2);
        assert_eq!(p.append(b"def"), ParseStatus::Ok);
        let mut rest = [0u8; 8];
        let n = p.take_entity(&mut rest);
        assert_eq!(&rest[..n], b"cdef");
        assert_eq!(p.entity_total(), 6);
    }

    #[test]
    fn test_unknown_method_is_kept() {
        let mut p = Parser::new_request();
        assert_eq!(p.append(b"BREW /pot HTTP/1.1\r\nHost: h:1\r\n\r\n"), ParseStatus::Ok);
        assert_eq!(p.msg.method, Method::Unknown);
    }
}
