use bstr::{BStr, ByteSlice};

/// Headers the stack acts on. Anything else is preserved verbatim and
/// surfaced as an extra header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderId {
    Accept,
    AcceptCharset,
    AcceptEncoding,
    AcceptLanguage,
    AcceptRanges,
    CacheControl,
    Callback,
    Connection,
    ContentEncoding,
    ContentLanguage,
    ContentLength,
    ContentLocation,
    ContentRange,
    ContentType,
    Date,
    Expect,
    Ext,
    Host,
    IfRange,
    Location,
    Man,
    Mx,
    Nt,
    Nts,
    Range,
    Seq,
    Server,
    Sid,
    SoapAction,
    St,
    Te,
    Timeout,
    TransferEncoding,
    UserAgent,
    Usn,
    XUserAgent,
}

impl HeaderId {
    pub fn from_name(name: &[u8]) -> Option<HeaderId> {
        use HeaderId::*;
        let id = match name.to_ascii_lowercase().as_slice() {
            b"accept" => Accept,
            b"accept-charset" => AcceptCharset,
            b"accept-encoding" => AcceptEncoding,
            b"accept-language" => AcceptLanguage,
            b"accept-ranges" => AcceptRanges,
            b"cache-control" => CacheControl,
            b"callback" => Callback,
            b"connection" => Connection,
            b"content-encoding" => ContentEncoding,
            b"content-language" => ContentLanguage,
            b"content-length" => ContentLength,
            b"content-location" => ContentLocation,
            b"content-range" => ContentRange,
            b"content-type" => ContentType,
            b"date" => Date,
            b"expect" => Expect,
            b"ext" => Ext,
            b"host" => Host,
            b"if-range" => IfRange,
            b"location" => Location,
            b"man" => Man,
            b"mx" => Mx,
            b"nt" => Nt,
            b"nts" => Nts,
            b"range" => Range,
            b"seq" => Seq,
            b"server" => Server,
            b"sid" => Sid,
            b"soapaction" => SoapAction,
            b"st" => St,
            b"te" => Te,
            b"timeout" => Timeout,
            b"transfer-encoding" => TransferEncoding,
            b"user-agent" => UserAgent,
            b"usn" => Usn,
            b"x-user-agent" => XUserAgent,
            _ => return None,
        };
        Some(id)
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub name: Vec<u8>,
    pub id: Option<HeaderId>,
    pub value: Vec<u8>,
}

/// Ordered header map. Name matching is case-insensitive; a repeated name
/// keeps its original position but the later value wins.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Headers {
        Headers::default()
    }

    pub fn add(&mut self, name: &[u8], value: &[u8]) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|h| h.name.eq_ignore_ascii_case(name))
        {
            existing.value = value.to_vec();
            return;
        }
        self.entries.push(Header {
            name: name.to_vec(),
            id: HeaderId::from_name(name),
            value: value.to_vec(),
        });
    }

    pub fn get(&self, id: HeaderId) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|h| h.id == Some(id))
            .map(|h| h.value.as_slice())
    }

    pub fn get_str(&self, id: HeaderId) -> Option<&str> {
        self.get(id).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn get_named(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    pub fn contains(&self, id: HeaderId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    /// Headers outside the known table, in arrival order.
    pub fn unknown(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter().filter(|h| h.id.is_none())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for Headers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for h in &self.entries {
            writeln!(f, "{}: {}", BStr::new(&h.name), BStr::new(&h.value))?;
        }
        Ok(())
    }
}

/// Case-insensitive substring search, used for token checks inside header
/// values ("chunked", "trailers").
pub fn value_contains(value: &[u8], token: &str) -> bool {
    value
        .to_ascii_lowercase()
        .find(token.to_ascii_lowercase().as_bytes())
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut h = Headers::new();
        h.add(b"Content-Length", b"42");
        assert_eq!(h.get(HeaderId::ContentLength), Some(&b"42"[..]));
        assert_eq!(h.get_named(b"CONTENT-LENGTH"), Some(&b"42"[..]));
    }

    #[test]
    fn test_last_value_wins_keeps_position() {
        let mut h = Headers::new();
        h.add(b"Host", b"a");
        h.add(b"X-Custom", b"1");
        h.add(b"HOST", b"b");
        assert_eq!(h.get(HeaderId::Host), Some(&b"b"[..]));
        let names: Vec<_> = h.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, vec![b"Host".to_vec(), b"X-Custom".to_vec()]);
    }

    #[test]
    fn test_unknown_headers_preserved() {
        let mut h = Headers::new();
        h.add(b"Host", b"a");
        h.add(b"X-AV-Client-Info", b"av=1.0");
        let unknown: Vec<_> = h.unknown().collect();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].name, b"X-AV-Client-Info");
    }

    #[test]
    fn test_value_contains() {
        assert!(value_contains(b"gzip, Chunked", "chunked"));
        assert!(!value_contains(b"identity", "chunked"));
    }
}
