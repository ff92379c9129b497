use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::config::UPNP_USING_CHUNKED;
use crate::error::{Error, Result};

/// Opaque value registered alongside a virtual directory and handed back on
/// every callback.
pub type Cookie = Arc<dyn std::any::Any + Send + Sync>;

/// Attributes of a servable document, filled by `get_info` callbacks or by
/// a filesystem stat.
#[derive(Default)]
pub struct FileInfo {
    /// Negative values are sentinels: [`UPNP_USING_CHUNKED`] asks for a
    /// chunked response, -1 means unknown length (read until EOF).
    pub file_length: i64,
    pub last_modified: Option<SystemTime>,
    pub is_directory: bool,
    pub is_readable: bool,
    pub content_type: Option<String>,
    /// Unrecognized request headers, surfaced to the handler.
    pub request_headers: Vec<(Vec<u8>, Vec<u8>)>,
    /// Headers the handler wants added to the response.
    pub response_headers: Vec<(String, String)>,
    /// Address of the requesting control point.
    pub ctrlpt_addr: Option<SocketAddr>,
    /// The client's User-Agent value.
    pub os: Option<String>,
}

impl FileInfo {
    pub fn wants_chunked(&self) -> bool {
        self.file_length == UPNP_USING_CHUNKED
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open virtual document. Closing is dropping.
pub trait VirtualFile: Send {
    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<usize>;
    fn seek(&mut self, pos: SeekFrom) -> anyhow::Result<u64>;
}

/// Callback set servicing one registered path prefix.
pub trait VirtualDirHandler: Send + Sync {
    fn get_info(&self, path: &str, info: &mut FileInfo, cookie: &Cookie) -> anyhow::Result<()>;
    fn open(
        &self,
        path: &str,
        mode: OpenMode,
        cookie: &Cookie,
    ) -> anyhow::Result<Box<dyn VirtualFile>>;
}

struct VirtualDirEntry {
    name: String,
    cookie: Cookie,
    handler: Arc<dyn VirtualDirHandler>,
}

/// Registered virtual directories. Read-mostly; registration happens during
/// initialization.
#[derive(Default)]
pub struct VirtualDirRegistry {
    entries: RwLock<Vec<VirtualDirEntry>>,
}

impl VirtualDirRegistry {
    pub fn register(
        &self,
        name: &str,
        handler: Arc<dyn VirtualDirHandler>,
        cookie: Cookie,
    ) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidParam);
        }
        let name = if name.starts_with('/') {
            name.to_owned()
        } else {
            format!("/{name}")
        };
        let mut entries = self.entries.write();
        // Re-registering a name replaces its handler.
        entries.retain(|e| e.name != name);
        entries.push(VirtualDirEntry {
            name,
            cookie,
            handler,
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) {
        self.entries.write().retain(|e| e.name != name);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// A path matches an entry if the prefix equals the entry name and the
    /// next path character is `/`, `?` or end-of-string (or the entry name
    /// itself ends with `/`).
    pub fn match_path(&self, path: &str) -> Option<(Arc<dyn VirtualDirHandler>, Cookie)> {
        let entries = self.entries.read();
        for entry in entries.iter() {
            let name = &entry.name;
            if name.ends_with('/') {
                if path.starts_with(name.as_str()) {
                    return Some((entry.handler.clone(), entry.cookie.clone()));
                }
            } else if let Some(rest) = path.strip_prefix(name.as_str()) {
                if matches!(rest.as_bytes().first(), None | Some(b'/') | Some(b'?')) {
                    return Some((entry.handler.clone(), entry.cookie.clone()));
                }
            }
        }
        None
    }
}

/// An in-memory document bound to a path, typically the device description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasDoc {
    pub name: String,
    pub doc: Vec<u8>,
    pub last_modified: SystemTime,
}

/// Single-slot alias cache. A reader grabs an `Arc` clone under the lock;
/// the bytes stay alive for that reader even across a concurrent `set`.
#[derive(Default)]
pub struct AliasCache {
    slot: Mutex<Option<Arc<AliasDoc>>>,
}

impl AliasCache {
    /// Replace or clear the alias atomically.
    pub fn set(&self, alias: Option<AliasDoc>) -> Result<()> {
        let alias = match alias {
            Some(mut a) => {
                if a.name.is_empty() {
                    return Err(Error::InvalidParam);
                }
                if !a.name.starts_with('/') {
                    a.name.insert(0, '/');
                }
                Some(Arc::new(a))
            }
            None => None,
        };
        let mut slot = self.slot.lock();
        if let Some(a) = &alias {
            debug!(name = %a.name, len = a.doc.len(), "alias set");
        }
        *slot = alias;
        Ok(())
    }

    pub fn grab(&self) -> Option<Arc<AliasDoc>> {
        self.slot.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.slot.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;
    impl VirtualDirHandler for NoopHandler {
        fn get_info(&self, _: &str, _: &mut FileInfo, _: &Cookie) -> anyhow::Result<()> {
            Ok(())
        }
        fn open(
            &self,
            _: &str,
            _: OpenMode,
            _: &Cookie,
        ) -> anyhow::Result<Box<dyn VirtualFile>> {
            anyhow::bail!("not a real handler")
        }
    }

    fn registry_with(name: &str) -> VirtualDirRegistry {
        let reg = VirtualDirRegistry::default();
        reg.register(name, Arc::new(NoopHandler), Arc::new(()))
            .unwrap();
        reg
    }

    #[test]
    fn test_match_rules() {
        let reg = registry_with("/vdir");
        assert!(reg.match_path("/vdir").is_some());
        assert!(reg.match_path("/vdir/file").is_some());
        assert!(reg.match_path("/vdir?x=1").is_some());
        assert!(reg.match_path("/vdirx").is_none());
        assert!(reg.match_path("/other").is_none());
    }

    #[test]
    fn test_match_trailing_slash_entry() {
        let reg = registry_with("/vdir/");
        assert!(reg.match_path("/vdir/file").is_some());
        assert!(reg.match_path("/vdir").is_none());
    }

    #[test]
    fn test_leading_slash_added() {
        let reg = registry_with("vdir");
        assert!(reg.match_path("/vdir/x").is_some());
    }

    #[test]
    fn test_alias_grab_survives_replacement() {
        let cache = AliasCache::default();
        cache
            .set(Some(AliasDoc {
                name: "/desc.xml".to_owned(),
                doc: b"<root/>\n".to_vec(),
                last_modified: SystemTime::UNIX_EPOCH,
            }))
            .unwrap();
        let grabbed = cache.grab().unwrap();
        cache
            .set(Some(AliasDoc {
                name: "/desc.xml".to_owned(),
                doc: b"<other/>\n".to_vec(),
                last_modified: SystemTime::UNIX_EPOCH,
            }))
            .unwrap();
        // The old grab still sees the old bytes.
        assert_eq!(grabbed.doc, b"<root/>\n");
        assert_eq!(cache.grab().unwrap().doc, b"<other/>\n");
    }

    #[test]
    fn test_alias_concurrent_grab_release() {
        let cache = Arc::new(AliasCache::default());
        cache
            .set(Some(AliasDoc {
                name: "/d.xml".to_owned(),
                doc: vec![7u8; 4096],
                last_modified: SystemTime::UNIX_EPOCH,
            }))
            .unwrap();
        let mut threads = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if let Some(doc) = cache.grab() {
                        assert!(doc.doc.iter().all(|&b| b == 7));
                    }
                }
            }));
        }
        for _ in 0..50 {
            cache
                .set(Some(AliasDoc {
                    name: "/d.xml".to_owned(),
                    doc: vec![7u8; 4096],
                    last_modified: SystemTime::UNIX_EPOCH,
                }))
                .unwrap();
        }
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_alias_clear() {
        let cache = AliasCache::default();
        cache
            .set(Some(AliasDoc {
                name: "d.xml".to_owned(),
                doc: vec![],
                last_modified: SystemTime::UNIX_EPOCH,
            }))
            .unwrap();
        assert_eq!(cache.grab().unwrap().name, "/d.xml");
        cache.set(None).unwrap();
        assert!(!cache.is_valid());
    }
}
