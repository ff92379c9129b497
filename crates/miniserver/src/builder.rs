use std::time::SystemTime;

use crate::error::{Error, Result};
use crate::parser::Method;
use crate::uri::Uri;

/// One structural piece of an HTTP message. Every variant corresponds to a
/// format directive of the classic SDK's message maker; a response or
/// request is assembled by pushing parts through a [`MessageBuilder`].
#[derive(Debug)]
pub enum Part<'a> {
    /// `HTTP/maj.min <code> <reason>` line.
    StatusLine(u16),
    /// `<METHOD> <pathquery> HTTP/maj.min` line.
    RequestLine(Method, &'a str),
    /// Request line plus a HOST header derived from the URI.
    RequestLineWithHost(Method, &'a Uri),
    /// Minimal HTML body for a status response, with Content-Length and
    /// Content-Type.
    SimpleHtmlBody(u16),
    Raw(&'a [u8]),
    Str(&'a str),
    Crlf,
    /// `DATE:` header with the current time.
    DateNow,
    /// Bare RFC 1123 date text (no header name, no line ending).
    DateAt(SystemTime),
    /// `CONNECTION: close`, emitted only for HTTP/1.1 and above.
    ConnectionClose,
    TransferEncodingChunked,
    /// `CONTENT-RANGE: bytes first-last/total`.
    ContentRange { first: u64, last: u64, total: u64 },
    /// `CONTENT-LENGTH` plus `Accept-Ranges: bytes`.
    ContentLength(u64),
    ContentType(&'a str),
    /// `SERVER:` header with OS and SDK info.
    Server,
    /// `USER-AGENT:` header with OS and SDK info.
    UserAgent,
    XUserAgent(&'a str),
    /// `CONTENT-LANGUAGE:`, emitted only when the client sent
    /// Accept-Language and a language is configured.
    ContentLanguage {
        accept_language: &'a str,
        content_language: &'a str,
    },
    /// Extra response headers, one `name: value` line each.
    ExtraHeaders(&'a [(String, String)]),
}

pub struct MessageBuilder {
    buf: Vec<u8>,
    major: u8,
    minor: u8,
}

impl MessageBuilder {
    pub fn new(major: u8, minor: u8) -> MessageBuilder {
        MessageBuilder {
            buf: Vec::new(),
            major,
            minor,
        }
    }

    /// Append every part in order. On failure the buffer is left empty.
    pub fn build(mut self, parts: &[Part<'_>]) -> Result<Vec<u8>> {
        for part in parts {
            if let Err(e) = self.append(part) {
                self.buf.clear();
                return Err(e);
            }
        }
        Ok(self.buf)
    }

    fn push_str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn push_line(&mut self, s: &str) {
        self.push_str(s);
        self.buf.extend_from_slice(b"\r\n");
    }

    fn append(&mut self, part: &Part<'_>) -> Result<()> {
        match part {
            Part::StatusLine(code) => {
                let line = format!(
                    "HTTP/{}.{} {} {}",
                    self.major,
                    self.minor,
                    code,
                    status_text(*code)
                );
                self.push_line(&line);
            }
            Part::RequestLine(method, pathquery) => {
                let line = format!(
                    "{} {} HTTP/{}.{}",
                    method.as_str(),
                    pathquery,
                    self.major,
                    self.minor
                );
                self.push_line(&line);
            }
            Part::RequestLineWithHost(method, uri) => {
                let hostport = uri
                    .hostport
                    .as_ref()
                    .ok_or(Error::InvalidUrl("relative url in request line"))?;
                let pathquery = if uri.pathquery.is_empty() {
                    "/"
                } else {
                    uri.pathquery.as_str()
                };
                self.append(&Part::RequestLine(*method, pathquery))?;
                self.push_line(&format!("HOST: {}", hostport.text));
            }
            Part::SimpleHtmlBody(code) => {
                let body = format!(
                    "<html><body><h1>{} {}</h1></body></html>",
                    code,
                    status_text(*code)
                );
                self.append(&Part::ContentLength(body.len() as u64))?;
                self.append(&Part::ContentType("text/html"))?;
                self.append(&Part::Crlf)?;
                self.push_str(&body);
            }
            Part::Raw(bytes) => self.buf.extend_from_slice(bytes),
            Part::Str(s) => self.push_str(s),
            Part::Crlf => self.buf.extend_from_slice(b"\r\n"),
            Part::DateNow => {
                self.push_line(&format!("DATE: {}", http_date(SystemTime::now())));
            }
            Part::DateAt(t) => self.push_str(&http_date(*t)),
            Part::ConnectionClose => {
                if self.major > 1 || (self.major == 1 && self.minor >= 1) {
                    self.push_line("CONNECTION: close");
                }
            }
            Part::TransferEncodingChunked => self.push_line("TRANSFER-ENCODING: chunked"),
            Part::ContentRange { first, last, total } => {
                self.push_line(&format!("CONTENT-RANGE: bytes {first}-{last}/{total}"));
            }
            Part::ContentLength(len) => {
                self.push_line(&format!("CONTENT-LENGTH: {len}"));
                self.push_line("Accept-Ranges: bytes");
            }
            Part::ContentType(ct) => self.push_line(&format!("CONTENT-TYPE: {ct}")),
            Part::Server => self.push_line(&format!("SERVER: {}", sdk_info())),
            Part::UserAgent => self.push_line(&format!("USER-AGENT: {}", sdk_info())),
            Part::XUserAgent(ua) => self.push_line(&format!("X-User-Agent: {ua}")),
            Part::ContentLanguage {
                accept_language,
                content_language,
            } => {
                if !accept_language.is_empty() && !content_language.is_empty() {
                    self.push_line(&format!("CONTENT-LANGUAGE: {content_language}"));
                }
            }
            Part::ExtraHeaders(extras) => {
                for (name, value) in extras.iter() {
                    self.push_line(&format!("{name}: {value}"));
                }
            }
        }
        Ok(())
    }
}

/// RFC 1123 date in GMT, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: SystemTime) -> String {
    let dt: chrono::DateTime<chrono::Utc> = t.into();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// `<sysname>/<release>, UPnP/1.0, Portable SDK for UPnP devices/<version>`.
pub fn sdk_info() -> String {
    let (sysname, release) = match nix::sys::utsname::uname() {
        Ok(uts) => (
            uts.sysname().to_string_lossy().into_owned(),
            uts.release().to_string_lossy().into_owned(),
        ),
        Err(_) => ("Unknown".to_owned(), "0.0".to_owned()),
    };
    format!(
        "{}/{}, UPnP/1.0, Portable SDK for UPnP devices/{}",
        sysname,
        release,
        env!("CARGO_PKG_VERSION")
    )
}

/// HTTP/1.1 requests get HTTP/1.1 responses; older clients are answered in
/// their own version.
pub fn response_version(request_major: u8, request_minor: u8) -> (u8, u8) {
    if request_major > 1 || (request_major == 1 && request_minor >= 1) {
        (1, 1)
    } else {
        (request_major, request_minor)
    }
}
