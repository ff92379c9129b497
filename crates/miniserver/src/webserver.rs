use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::builder::{MessageBuilder, Part, response_version};
use crate::config::WEB_SERVER_BUF_SIZE;
use crate::error::Result;
use crate::headers::{HeaderId, value_contains};
use crate::parser::{HttpMessage, Method, ParseStatus};
use crate::sock::Connection;
use crate::state::{RequestContext, RequestHandler, ServerState};
use crate::uri::{remove_dots, unescape};
use crate::vfs::{AliasDoc, Cookie, FileInfo, OpenMode, VirtualDirHandler, VirtualFile};

/// What the caller should stream after the headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    /// Static document from the filesystem.
    FileDoc,
    /// The in-memory alias document.
    XmlDoc,
    /// Virtual-directory document through callbacks.
    WebDoc,
    /// Headers only (HEAD).
    Headers,
    /// Request entity must be received into the target file.
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    /// Byte offset to seek to before sending.
    pub offset: u64,
    pub first: u64,
    pub last: u64,
    pub total: u64,
}

/// Amount to stream: an exact count, or until the source reports EOF
/// (virtual files of unknown length).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendSize {
    Exact(u64),
    UntilEof,
}

/// Per-response streaming directives.
pub struct SendInstruction {
    pub size: SendSize,
    pub range: Option<RangeSpec>,
    pub chunked: bool,
    pub trailers: bool,
    pub accept_language: String,
    /// Declared Content-Length of a POST body.
    pub recv_write_size: Option<u64>,
    /// Matched virtual directory, if any.
    pub vdir: Option<(Arc<dyn VirtualDirHandler>, Cookie)>,
}

impl Default for SendInstruction {
    fn default() -> Self {
        Self {
            size: SendSize::Exact(0),
            range: None,
            chunked: false,
            trailers: false,
            accept_language: String::new(),
            recv_write_size: None,
            vdir: None,
        }
    }
}

impl std::fmt::Debug for SendInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendInstruction")
            .field("size", &self.size)
            .field("range", &self.range)
            .field("chunked", &self.chunked)
            .field("trailers", &self.trailers)
            .field("accept_language", &self.accept_language)
            .field("recv_write_size", &self.recv_write_size)
            .field("vdir", &self.vdir.is_some())
            .finish()
    }
}

/// An HTTP-level rejection. `range_total` carries the entity size for 416
/// responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusError {
    pub code: u16,
    pub range_total: Option<u64>,
}

impl From<u16> for StatusError {
    fn from(code: u16) -> StatusError {
        StatusError {
            code,
            range_total: None,
        }
    }
}

pub struct ProcessedRequest {
    pub resp_type: RespType,
    /// Rendered response headers; empty for an HTTP/0.9 simple get.
    pub headers: Vec<u8>,
    /// Virtual path or filesystem path of the target document.
    pub filename: String,
    pub alias: Option<Arc<AliasDoc>>,
    pub instr: SendInstruction,
}

fn content_type_for(path: &str) -> String {
    let ext = std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) => mime_guess::from_ext(&ext)
            .first_or_octet_stream()
            .essence_str()
            .to_owned(),
        None => "application/octet-stream".to_owned(),
    }
}

fn get_file_info(path: &str, info: &mut FileInfo) -> std::io::Result<()> {
    let meta = fs::metadata(path)?;
    info.is_directory = meta.is_dir();
    info.file_length = meta.len() as i64;
    info.last_modified = meta.modified().ok();
    info.is_readable = fs::File::open(path).is_ok();
    info.content_type = Some(content_type_for(path));
    trace!(
        path,
        length = info.file_length,
        readable = info.is_readable,
        "file info"
    );
    Ok(())
}

fn append_index_html(filename: &mut String) {
    if !filename.ends_with('/') {
        filename.push('/');
    }
    filename.push_str("index.html");
}

/// Parse one `bytes=` range specifier and fill the send instruction.
/// Accepts `FIRST-LAST`, `FIRST-` and `-SUFFIX`.
fn create_range_response(
    value: &str,
    file_length: i64,
    instr: &mut SendInstruction,
) -> std::result::Result<(), StatusError> {
    let Some(eq) = value.find('=') else {
        return Err(400.into());
    };
    if !value[..eq].trim().eq_ignore_ascii_case("bytes") {
        return Err(400.into());
    }
    let spec = value[eq + 1..].trim();
    let spec = spec.split(',').next().unwrap_or("").trim();

    if file_length < 0 {
        // Length unknown; only the degenerate whole-document range is fine.
        if spec == "0-" {
            return Ok(());
        }
        return Err(416.into());
    }
    let total = file_length as u64;
    let unsatisfiable = StatusError {
        code: 416,
        range_total: Some(total),
    };

    let Some(dash) = spec.find('-') else {
        return Err(unsatisfiable);
    };
    let (first_txt, last_txt) = (spec[..dash].trim(), spec[dash + 1..].trim());
    let parse = |s: &str| s.parse::<u64>().ok();

    let (offset, first, last) = match (first_txt.is_empty(), last_txt.is_empty()) {
        (false, false) => {
            let (Some(first), Some(last)) = (parse(first_txt), parse(last_txt)) else {
                return Err(unsatisfiable);
            };
            if first >= total || last < first {
                return Err(unsatisfiable);
            }
            (first, first, last.min(total - 1))
        }
        (false, true) => {
            let Some(first) = parse(first_txt) else {
                return Err(unsatisfiable);
            };
            if first >= total {
                return Err(unsatisfiable);
            }
            (first, first, total - 1)
        }
        (true, false) => {
            let Some(suffix) = parse(last_txt) else {
                return Err(unsatisfiable);
            };
            if suffix == 0 {
                return Err(unsatisfiable);
            }
            if suffix >= total {
                (0, 0, total.saturating_sub(1))
            } else {
                (total - suffix, total - suffix, total - 1)
            }
        }
        (true, true) => return Err(unsatisfiable),
    };

    instr.range = Some(RangeSpec {
        offset,
        first,
        last,
        total,
    });
    instr.size = SendSize::Exact(last - first + 1);
    Ok(())
}

/// Walk the request headers, filling the send instruction (TE, Range,
/// Accept-Language, Content-Length).
fn check_other_headers(
    msg: &HttpMessage,
    instr: &mut SendInstruction,
    file_length: i64,
) -> std::result::Result<(), StatusError> {
    for h in msg.headers.iter() {
        match h.id {
            Some(HeaderId::Te) => {
                instr.chunked = true;
                if value_contains(&h.value, "trailers") {
                    instr.trailers = true;
                }
            }
            Some(HeaderId::ContentLength) => {
                instr.recv_write_size = std::str::from_utf8(&h.value)
                    .ok()
                    .and_then(|s| s.trim().parse().ok());
            }
            Some(HeaderId::Range) => {
                let value = String::from_utf8_lossy(&h.value);
                create_range_response(&value, file_length, instr)?;
            }
            Some(HeaderId::AcceptLanguage) => {
                instr.accept_language = String::from_utf8_lossy(&h.value).into_owned();
            }
            _ => {}
        }
    }
    Ok(())
}

fn build_response_headers(
    state: &ServerState,
    major: u8,
    minor: u8,
    finfo: &FileInfo,
    instr: &SendInstruction,
) -> std::result::Result<Vec<u8>, StatusError> {
    let code = if instr.range.is_some() { 206 } else { 200 };
    let content_type = finfo
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_owned());
    let lang = Part::ContentLanguage {
        accept_language: &instr.accept_language,
        content_language: &state.config.content_language,
    };

    let mut parts = vec![Part::StatusLine(code)];
    match (&instr.range, instr.chunked) {
        (Some(r), true) => {
            parts.push(Part::ContentType(&content_type));
            parts.push(Part::ContentRange {
                first: r.first,
                last: r.last,
                total: r.total,
            });
            parts.push(Part::TransferEncodingChunked);
        }
        (Some(r), false) => {
            if let SendSize::Exact(n) = instr.size {
                parts.push(Part::ContentLength(n));
            }
            parts.push(Part::ContentType(&content_type));
            parts.push(Part::ContentRange {
                first: r.first,
                last: r.last,
                total: r.total,
            });
        }
        (None, true) => {
            parts.push(Part::TransferEncodingChunked);
            parts.push(Part::ContentType(&content_type));
        }
        (None, false) => {
            if let SendSize::Exact(n) = instr.size {
                parts.push(Part::ContentLength(n));
            }
            parts.push(Part::ContentType(&content_type));
        }
    }
    parts.push(lang);
    parts.push(Part::DateNow);
    if let Some(mtime) = finfo.last_modified {
        parts.push(Part::Str("LAST-MODIFIED: "));
        parts.push(Part::DateAt(mtime));
        parts.push(Part::Crlf);
    }
    parts.push(Part::Server);
    parts.push(Part::XUserAgent(&state.config.x_user_agent));
    parts.push(Part::ExtraHeaders(&finfo.response_headers));
    parts.push(Part::ConnectionClose);
    parts.push(Part::Crlf);

    MessageBuilder::new(major, minor)
        .build(&parts)
        .map_err(|_| StatusError::from(500))
}

/// Resolve a GET/HEAD/POST/SIMPLEGET request to a servable document and
/// rendered response headers.
pub fn process_request(
    state: &ServerState,
    msg: &HttpMessage,
    peer: SocketAddr,
) -> std::result::Result<ProcessedRequest, StatusError> {
    let url = msg.uri.as_ref().ok_or(StatusError::from(500))?;
    let (resp_major, resp_minor) = response_version(msg.major, msg.minor);

    let request_doc = unescape(&url.pathquery);
    let request_doc = remove_dots(&request_doc).ok_or(StatusError::from(403))?;
    if !request_doc.starts_with('/') {
        return Err(400.into());
    }

    let mut instr = SendInstruction::default();
    let mut finfo = FileInfo::default();
    let mut filename;
    let mut alias = None;
    let mut using_alias = false;

    if let Some((handler, cookie)) = state.vdirs.match_path(&request_doc) {
        filename = request_doc.clone();
        instr.vdir = Some((handler, cookie));
    } else {
        filename = String::new();
        if let Some(doc) = state.alias.grab() {
            if doc.name == request_doc {
                using_alias = true;
                finfo.file_length = doc.doc.len() as i64;
                finfo.is_readable = true;
                finfo.last_modified = Some(doc.last_modified);
                finfo.content_type = Some("text/xml; charset=\"utf-8\"".to_owned());
                alias = Some(doc);
            }
        }
    }

    if let Some((handler, cookie)) = instr.vdir.clone() {
        if msg.method != Method::Post {
            finfo.request_headers = msg
                .headers
                .unknown()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect();
            finfo.ctrlpt_addr = Some(peer);
            finfo.os = msg.headers.get_str(HeaderId::UserAgent).map(str::to_owned);
            handler
                .get_info(&filename, &mut finfo, &cookie)
                .map_err(|_| StatusError::from(404))?;
            if finfo.is_directory {
                append_index_html(&mut filename);
                let again = handler.get_info(&filename, &mut finfo, &cookie);
                if again.is_err() || finfo.is_directory {
                    return Err(404.into());
                }
            }
            if !finfo.is_readable {
                return Err(403.into());
            }
        }
    } else if !using_alias {
        let root = state
            .config
            .document_root
            .as_ref()
            .ok_or(StatusError::from(500))?;
        let path_only = request_doc.split('?').next().unwrap_or("");
        filename = format!("{}{}", root.display(), path_only);
        while filename.ends_with('/') && filename.len() > 1 {
            filename.pop();
        }
        if msg.method != Method::Post {
            get_file_info(&filename, &mut finfo).map_err(|_| StatusError::from(404))?;
            if finfo.is_directory {
                append_index_html(&mut filename);
                let again = get_file_info(&filename, &mut finfo);
                if again.is_err() || finfo.is_directory {
                    return Err(404.into());
                }
            }
            if !finfo.is_readable {
                return Err(403.into());
            }
        }
    }

    instr.size = if finfo.file_length >= 0 {
        SendSize::Exact(finfo.file_length as u64)
    } else {
        SendSize::UntilEof
    };
    check_other_headers(msg, &mut instr, finfo.file_length)?;

    if msg.method == Method::Post {
        return Ok(ProcessedRequest {
            resp_type: RespType::Post,
            headers: Vec::new(),
            filename,
            alias: None,
            instr,
        });
    }

    if instr.vdir.is_some() && finfo.wants_chunked() {
        instr.chunked = true;
        instr.size = SendSize::UntilEof;
    }
    // Chunked framing is HTTP/1.1 only.
    if instr.chunked && !(resp_major == 1 && resp_minor == 1) {
        return Err(406.into());
    }

    let headers = if msg.method == Method::SimpleGet {
        Vec::new()
    } else {
        build_response_headers(state, resp_major, resp_minor, &finfo, &instr)?
    };

    let resp_type = if msg.method == Method::Head {
        RespType::Headers
    } else if using_alias {
        RespType::XmlDoc
    } else if instr.vdir.is_some() {
        RespType::WebDoc
    } else {
        RespType::FileDoc
    };

    Ok(ProcessedRequest {
        resp_type,
        headers,
        filename,
        alias,
        instr,
    })
}

/// Send a bare status response with the standard short HTML body.
pub fn send_status_response(
    conn: &mut Connection,
    err: StatusError,
    major: u8,
    minor: u8,
    timeout: Duration,
) {
    let (major, minor) = response_version(major, minor);
    let content_range = err
        .range_total
        .map(|total| format!("CONTENT-RANGE: bytes */{total}"));
    let mut parts = vec![Part::StatusLine(err.code), Part::Server, Part::ConnectionClose];
    if let Some(line) = &content_range {
        parts.push(Part::Str(line));
        parts.push(Part::Crlf);
    }
    parts.push(Part::SimpleHtmlBody(err.code));
    if let Ok(buf) = MessageBuilder::new(major, minor).build(&parts) {
        let _ = conn.write_all(&buf, timeout);
    }
}

enum DocSource<'a> {
    File(fs::File),
    Virtual(Box<dyn VirtualFile>),
    Memory(&'a [u8]),
}

impl DocSource<'_> {
    fn seek_to(&mut self, offset: u64) -> anyhow::Result<()> {
        match self {
            DocSource::File(f) => {
                f.seek(SeekFrom::Start(offset))?;
            }
            DocSource::Virtual(v) => {
                v.seek(SeekFrom::Current(offset as i64))?;
            }
            DocSource::Memory(bytes) => {
                let at = (offset as usize).min(bytes.len());
                *bytes = &bytes[at..];
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        match self {
            DocSource::File(f) => Ok(f.read(buf)?),
            DocSource::Virtual(v) => v.read(buf),
            DocSource::Memory(bytes) => {
                let n = buf.len().min(bytes.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                *bytes = &bytes[n..];
                Ok(n)
            }
        }
    }
}

/// Stream a document body, chunk-framed when requested. An exact send size
/// that hits EOF early is a read error; `UntilEof` treats EOF as success.
fn send_doc(
    conn: &mut Connection,
    src: &mut DocSource<'_>,
    instr: &SendInstruction,
    timeout: Duration,
) -> anyhow::Result<()> {
    if let Some(range) = &instr.range {
        src.seek_to(range.offset)?;
    }
    let mut remaining = match instr.size {
        SendSize::Exact(n) => Some(n),
        SendSize::UntilEof => None,
    };
    let mut buf = vec![0u8; WEB_SERVER_BUF_SIZE];
    loop {
        let want = match remaining {
            Some(0) => break,
            Some(r) => (r as usize).min(buf.len()),
            None => buf.len(),
        };
        let n = src.read(&mut buf[..want])?;
        if n == 0 {
            if remaining.is_some() && !instr.chunked {
                anyhow::bail!("document shorter than advertised");
            }
            break;
        }
        if instr.chunked {
            let header = format!("{n:x}\r\n");
            conn.write_all(header.as_bytes(), timeout)?;
            conn.write_all(&buf[..n], timeout)?;
            conn.write_all(b"\r\n", timeout)?;
        } else {
            conn.write_all(&buf[..n], timeout)?;
        }
        if let Some(r) = &mut remaining {
            *r -= n as u64;
        }
    }
    if instr.chunked {
        conn.write_all(b"0\r\n\r\n", timeout)?;
    }
    Ok(())
}

enum PostTarget {
    Virtual(Box<dyn VirtualFile>),
    File(fs::File),
}

impl PostTarget {
    fn write_all(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        use std::io::Write;
        match self {
            PostTarget::Virtual(v) => {
                while !data.is_empty() {
                    let n = v.write(data)?;
                    if n == 0 {
                        anyhow::bail!("virtual file refused bytes");
                    }
                    data = &data[n..];
                }
            }
            PostTarget::File(f) => f.write_all(data)?,
        }
        Ok(())
    }
}

/// Receive a POST entity into the target document, chunk-decoded as needed.
/// Returns the status code to answer with.
fn recv_post_message(ctx: &mut RequestContext<'_>, pr: &ProcessedRequest) -> u16 {
    let timeout = ctx.state.config.timeout;
    let max = ctx.state.config.max_content_length;

    let mut target = match &pr.instr.vdir {
        Some((handler, cookie)) => {
            match handler.open(&pr.filename, OpenMode::Write, cookie) {
                Ok(f) => PostTarget::Virtual(f),
                Err(e) => {
                    debug!(filename = %pr.filename, "error opening virtual file for write: {e:#}");
                    return 500;
                }
            }
        }
        None => {
            if !ctx.state.config.enable_post_write {
                return 404;
            }
            match fs::File::create(&pr.filename) {
                Ok(f) => PostTarget::File(f),
                Err(_) => return 401,
            }
        }
    };

    let mut chunk = [0u8; 2048];
    loop {
        let status = ctx.parser.parse_entity();
        match status {
            ParseStatus::Ok | ParseStatus::Incomplete | ParseStatus::IncompleteEntity => {}
            _ => return 400,
        }
        if max > 0 && ctx.parser.entity_total() > max {
            return 413;
        }
        // Drain what is decoded so far.
        while ctx.parser.msg.entity_len > 0 {
            let n = ctx.parser.take_entity(&mut chunk);
            if target.write_all(&chunk[..n]).is_err() {
                return 500;
            }
        }
        if status == ParseStatus::Ok {
            break;
        }
        match ctx.conn.read(&mut chunk, timeout) {
            Ok(0) => {
                return if ctx.parser.eof() == ParseStatus::Ok {
                    200
                } else {
                    400
                };
            }
            Ok(n) => ctx.parser.append_bytes(&chunk[..n]),
            Err(_) => return 400,
        }
    }
    200
}

fn send_post_response(
    state: &ServerState,
    conn: &mut Connection,
    code: u16,
    major: u8,
    minor: u8,
    accept_language: &str,
) {
    let parts = [
        Part::StatusLine(code),
        Part::ContentType("text/html"),
        Part::ContentLanguage {
            accept_language,
            content_language: &state.config.content_language,
        },
        Part::Server,
        Part::XUserAgent(&state.config.x_user_agent),
        Part::ConnectionClose,
        Part::Crlf,
    ];
    if let Ok(buf) = MessageBuilder::new(major, minor).build(&parts) {
        let _ = conn.write_all(&buf, state.config.timeout);
    }
}

/// Entry point for GET/HEAD/POST/SIMPLEGET requests routed to the web
/// server.
pub fn serve(ctx: &mut RequestContext<'_>) -> Result<()> {
    let state = ctx.state.clone();
    let timeout = state.config.timeout;
    let (major, minor) = (ctx.parser.msg.major, ctx.parser.msg.minor);
    let peer = ctx.conn.peer;

    let pr = match process_request(&state, &ctx.parser.msg, peer) {
        Ok(pr) => pr,
        Err(err) => {
            debug!(code = err.code, "request rejected");
            send_status_response(ctx.conn, err, major, minor, timeout);
            return Ok(());
        }
    };

    match pr.resp_type {
        RespType::Headers => {
            ctx.conn.write_all(&pr.headers, timeout)?;
        }
        RespType::XmlDoc => {
            let Some(doc) = pr.alias.as_ref() else {
                send_status_response(ctx.conn, 500.into(), major, minor, timeout);
                return Ok(());
            };
            ctx.conn.write_all(&pr.headers, timeout)?;
            let mut src = DocSource::Memory(&doc.doc);
            if let Err(e) = send_doc(ctx.conn, &mut src, &pr.instr, timeout) {
                debug!("error sending alias document: {e:#}");
            }
        }
        RespType::WebDoc => {
            let Some((handler, cookie)) = pr.instr.vdir.as_ref() else {
                send_status_response(ctx.conn, 500.into(), major, minor, timeout);
                return Ok(());
            };
            match handler.open(&pr.filename, OpenMode::Read, cookie) {
                Ok(file) => {
                    ctx.conn.write_all(&pr.headers, timeout)?;
                    let mut src = DocSource::Virtual(file);
                    if let Err(e) = send_doc(ctx.conn, &mut src, &pr.instr, timeout) {
                        debug!(filename = %pr.filename, "error sending virtual document: {e:#}");
                    }
                }
                Err(e) => {
                    debug!(filename = %pr.filename, "error opening virtual document: {e:#}");
                    send_status_response(ctx.conn, 500.into(), major, minor, timeout);
                }
            }
        }
        RespType::FileDoc => match fs::File::open(&pr.filename) {
            Ok(file) => {
                ctx.conn.write_all(&pr.headers, timeout)?;
                let mut src = DocSource::File(file);
                if let Err(e) = send_doc(ctx.conn, &mut src, &pr.instr, timeout) {
                    debug!(filename = %pr.filename, "error sending file: {e:#}");
                }
            }
            Err(_) => {
                send_status_response(ctx.conn, 404.into(), major, minor, timeout);
            }
        },
        RespType::Post => {
            let code = recv_post_message(ctx, &pr);
            send_post_response(
                &state,
                ctx.conn,
                code,
                major,
                minor,
                &pr.instr.accept_language,
            );
        }
    }
    Ok(())
}

/// The built-in web callback set, installed by default.
pub struct WebServerHandler;

impl RequestHandler for WebServerHandler {
    fn handle(&self, ctx: &mut RequestContext<'_>) -> anyhow::Result<()> {
        serve(ctx)?;
        Ok(())
    }
}
