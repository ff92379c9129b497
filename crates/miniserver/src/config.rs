use std::path::PathBuf;
use std::time::Duration;

/// Sentinel content length: emit `Transfer-Encoding: chunked`.
pub const UPNP_USING_CHUNKED: i64 = -3;
/// Sentinel content length: no length header, connection close delimits.
pub const UPNP_UNTIL_CLOSE: i64 = -1;

/// First port tried when the caller passes 0 as the listen port hint,
/// per the IANA dynamic port range.
pub const APPLICATION_LISTENING_PORT: u16 = 49152;

/// Per-call socket timeout for request handling.
pub const HTTP_DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP connect bound used by the HTTP client.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on received entity bodies. 0 disables the check.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16_000;

/// Buffer size for streaming file and virtual-directory documents.
pub const WEB_SERVER_BUF_SIZE: usize = 1024 * 1024;

pub const X_USER_AGENT: &str = "redsonic";

#[derive(Debug, Clone)]
pub struct Config {
    /// Document root for filesystem-served paths. None disables plain file
    /// serving (alias and virtual-directory documents still work).
    pub document_root: Option<PathBuf>,
    /// Content-Language emitted when the client sent Accept-Language.
    /// Empty means the header is omitted.
    pub content_language: String,
    /// Respond to a non-numeric Host header with a 307 redirect to the
    /// numeric address instead of rejecting it with 400.
    pub allow_literal_host_redirection: bool,
    /// SO_REUSEADDR on the HTTP listeners. Off by default; the port hunt
    /// increments instead.
    pub reuseaddr: bool,
    /// Reject request bodies larger than this with 413. 0 = unlimited.
    pub max_content_length: usize,
    /// Allow POST to write files under the document root.
    pub enable_post_write: bool,
    pub x_user_agent: String,
    /// Per-call socket timeout for request handling.
    pub timeout: Duration,
    /// Also create the client-mode SSDP request sockets.
    pub client_ssdp_sockets: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            document_root: None,
            content_language: String::new(),
            allow_literal_host_redirection: false,
            reuseaddr: false,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            enable_post_write: false,
            x_user_agent: X_USER_AGENT.to_owned(),
            timeout: HTTP_DEFAULT_TIMEOUT,
            client_ssdp_sockets: false,
        }
    }
}
