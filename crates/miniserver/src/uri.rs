use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriKind {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    AbsPath,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    /// Host[:port] exactly as it appeared in the URI.
    pub text: String,
    /// Resolved at parse time: numeric fast path, else one DNS lookup.
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub kind: UriKind,
    pub path_kind: PathKind,
    pub scheme: String,
    pub hostport: Option<HostPort>,
    pub pathquery: String,
    pub fragment: Option<String>,
}

fn is_scheme_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.'
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 }
}

/// Split `host[:port]` text, honoring bracketed IPv6 literals, and resolve
/// it to a socket address.
pub fn resolve_hostport(text: &str, default_port: u16) -> Result<SocketAddr> {
    if text.is_empty() {
        return Err(Error::InvalidUrl("empty hostport"));
    }
    let (host, port) = split_hostport(text).ok_or(Error::InvalidUrl("malformed hostport"))?;
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| Error::InvalidUrl("bad port"))?,
        None => default_port,
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    // One DNS lookup; anything past that is external policy.
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidUrl("hostname did not resolve"))?
        .next()
        .ok_or(Error::InvalidUrl("hostname did not resolve"))
}

/// Returns (host, port-text). `[::1]:80` -> ("::1", Some("80")).
pub fn split_hostport(text: &str) -> Option<(&str, Option<&str>)> {
    if let Some(rest) = text.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        if after.is_empty() {
            return Some((host, None));
        }
        let port = after.strip_prefix(':')?;
        return Some((host, Some(port)));
    }
    match text.rfind(':') {
        // A bare colon means a port; two or more unbracketed colons would be
        // an IPv6 literal, which must be bracketed in a URI.
        Some(i) if text[..i].contains(':') => None,
        Some(i) => Some((&text[..i], Some(&text[i + 1..]))),
        None => Some((text, None)),
    }
}

impl Uri {
    /// Decompose a URI. Absolute URIs must use the http or https scheme and
    /// carry a non-empty hostport, which is resolved here.
    pub fn parse(s: &str) -> Result<Uri> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidUrl("empty url"));
        }
        let bytes = s.as_bytes();
        let scheme_end = if bytes[0].is_ascii_alphabetic() {
            bytes
                .iter()
                .position(|&b| !is_scheme_byte(b))
                .filter(|&i| bytes.get(i) == Some(&b':') && s[i..].starts_with("://"))
        } else {
            None
        };

        match scheme_end {
            Some(i) => {
                let scheme = s[..i].to_ascii_lowercase();
                if scheme != "http" && scheme != "https" {
                    return Err(Error::InvalidUrl("unsupported scheme"));
                }
                let rest = &s[i + 3..];
                let authority_end = rest
                    .find(|c| c == '/' || c == '?' || c == '#')
                    .unwrap_or(rest.len());
                let hostport_text = &rest[..authority_end];
                let addr = resolve_hostport(hostport_text, default_port(&scheme))?;
                let rest = &rest[authority_end..];
                let (pathquery, fragment) = split_fragment(rest);
                Ok(Uri {
                    kind: UriKind::Absolute,
                    path_kind: if pathquery.is_empty() || pathquery.starts_with('/') {
                        PathKind::AbsPath
                    } else {
                        PathKind::Opaque
                    },
                    scheme,
                    hostport: Some(HostPort {
                        text: hostport_text.to_owned(),
                        addr,
                    }),
                    pathquery: pathquery.to_owned(),
                    fragment,
                })
            }
            None => {
                let (pathquery, fragment) = split_fragment(s);
                Ok(Uri {
                    kind: UriKind::Relative,
                    path_kind: if pathquery.starts_with('/') {
                        PathKind::AbsPath
                    } else {
                        PathKind::Opaque
                    },
                    scheme: String::new(),
                    hostport: None,
                    pathquery: pathquery.to_owned(),
                    fragment,
                })
            }
        }
    }

    /// Normalize to the fixed form: an absolute URI with an empty path gets
    /// "/". Idempotent.
    pub fn fix(mut self) -> Uri {
        if self.kind == UriKind::Absolute && self.pathquery.is_empty() {
            self.pathquery.push('/');
            self.path_kind = PathKind::AbsPath;
        }
        self
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.hostport.as_ref().map(|hp| hp.addr)
    }
}

fn split_fragment(s: &str) -> (&str, Option<String>) {
    match s.find('#') {
        Some(i) => (&s[..i], Some(s[i + 1..].to_owned())),
        None => (s, None),
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode %XX escapes. Malformed escapes pass through untouched.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// RFC 3986 dot-segment removal on the path part (the query is untouched).
/// Returns None when a ".." segment would climb above the root.
pub fn remove_dots(pathquery: &str) -> Option<String> {
    let (path, query) = match pathquery.find('?') {
        Some(i) => (&pathquery[..i], &pathquery[i..]),
        None => (pathquery, ""),
    };
    let mut segments: Vec<&str> = Vec::new();
    let absolute = path.starts_with('/');
    let trailing_slash = path.ends_with('/') && path.len() > 1;
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                if segments.pop().is_none() && absolute {
                    // Escapes the document root.
                    return None;
                }
            }
            other => segments.push(other),
        }
    }
    let mut out = String::with_capacity(pathquery.len());
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if trailing_slash && !out.ends_with('/') {
        out.push('/');
    }
    out.push_str(query);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute() {
        let uri = Uri::parse("http://127.0.0.1:8080/desc.xml?a=b#frag").unwrap();
        assert_eq!(uri.kind, UriKind::Absolute);
        assert_eq!(uri.scheme, "http");
        let hp = uri.hostport.as_ref().unwrap();
        assert_eq!(hp.text, "127.0.0.1:8080");
        assert_eq!(hp.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(uri.pathquery, "/desc.xml?a=b");
        assert_eq!(uri.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn test_parse_default_ports() {
        let uri = Uri::parse("http://192.0.2.7/x").unwrap();
        assert_eq!(uri.addr().unwrap().port(), 80);
        let uri = Uri::parse("https://192.0.2.7/x").unwrap();
        assert_eq!(uri.addr().unwrap().port(), 443);
    }

    #[test]
    fn test_parse_bracketed_ipv6() {
        let uri = Uri::parse("http://[::1]:49152/").unwrap();
        assert_eq!(uri.addr().unwrap(), "[::1]:49152".parse().unwrap());
    }

    #[test]
    fn test_rejects_non_http_scheme() {
        assert!(matches!(
            Uri::parse("ftp://example.com/"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_rejects_empty_hostport() {
        assert!(Uri::parse("http:///x").is_err());
    }

    #[test]
    fn test_relative() {
        let uri = Uri::parse("/path/to/doc").unwrap();
        assert_eq!(uri.kind, UriKind::Relative);
        assert_eq!(uri.path_kind, PathKind::AbsPath);
        assert!(uri.hostport.is_none());
    }

    #[test]
    fn test_fix_is_idempotent() {
        let fixed = Uri::parse("http://127.0.0.1:80").unwrap().fix();
        assert_eq!(fixed.pathquery, "/");
        let again = fixed.clone().fix();
        assert_eq!(fixed, again);
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("/a%20b%2Fc"), "/a b/c");
        assert_eq!(unescape("/a%2"), "/a%2");
        assert_eq!(unescape("/a%zz"), "/a%zz");
    }

    #[test]
    fn test_remove_dots() {
        assert_eq!(remove_dots("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(remove_dots("/a/./b").unwrap(), "/a/b");
        assert_eq!(remove_dots("/a/b/").unwrap(), "/a/b/");
        assert_eq!(remove_dots("/a?x=../y").unwrap(), "/a?x=../y");
        assert_eq!(remove_dots("/").unwrap(), "/");
    }

    #[test]
    fn test_remove_dots_escape_is_error() {
        assert!(remove_dots("/../etc/passwd").is_none());
        assert!(remove_dots("/a/../../etc").is_none());
    }

    #[test]
    fn test_split_hostport_forms() {
        assert_eq!(split_hostport("h:80"), Some(("h", Some("80"))));
        assert_eq!(split_hostport("h"), Some(("h", None)));
        assert_eq!(split_hostport("[::1]"), Some(("::1", None)));
        assert_eq!(split_hostport("[::1]:80"), Some(("::1", Some("80"))));
        assert_eq!(split_hostport("::1"), None);
    }
}
