use std::sync::Arc;

use parking_lot::RwLock;
use threadutil::{ThreadPool, ThreadPoolAttr, TimerThread};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::parser::{ParseStatus, Parser};
use crate::sock::Connection;
use crate::ssdp::SsdpHandler;
use crate::vfs::{AliasCache, VirtualDirRegistry};
use crate::webserver::WebServerHandler;

/// Everything a worker needs to service a request. Handlers receive it with
/// the headers parsed; the entity may still be in flight (see
/// [`ParseStatus::Continue1`]).
pub struct RequestContext<'a> {
    pub parser: &'a mut Parser,
    pub conn: &'a mut Connection,
    pub state: &'a Arc<ServerState>,
}

impl RequestContext<'_> {
    /// Read the rest of the request entity into memory, enforcing the
    /// configured content-length cap. For handlers that want the whole
    /// body (SOAP, GENA notify).
    pub fn read_entity(&mut self) -> Result<Vec<u8>> {
        let max = self.state.config.max_content_length;
        let timeout = self.state.config.timeout;
        let mut chunk = [0u8; 2048];
        loop {
            match self.parser.parse_entity() {
                ParseStatus::Ok => break,
                ParseStatus::Incomplete | ParseStatus::IncompleteEntity => {}
                _ => return Err(Error::BadHttpMsg),
            }
            if max > 0 && self.parser.entity_total() > max {
                return Err(Error::OutOfBounds);
            }
            let n = self.conn.read(&mut chunk, timeout)?;
            if n == 0 {
                match self.parser.eof() {
                    ParseStatus::Ok => break,
                    _ => return Err(Error::BadHttpMsg),
                }
            } else {
                self.parser.append_bytes(&chunk[..n]);
            }
        }
        if max > 0 && self.parser.entity_total() > max {
            return Err(Error::OutOfBounds);
        }
        let mut body = vec![0u8; self.parser.msg.entity_len];
        self.parser.take_entity(&mut body);
        Ok(body)
    }
}

/// A protocol handler wired into the dispatcher (SOAP, GENA, or the web
/// server). Registered by move; invoked on a worker thread.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &mut RequestContext<'_>) -> anyhow::Result<()>;
}

/// External Host-header policy. When registered, its verdict is terminal.
pub trait HostValidateHandler: Send + Sync {
    fn validate(&self, host_port: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Handlers {
    soap: Option<Arc<dyn RequestHandler>>,
    gena: Option<Arc<dyn RequestHandler>>,
    web: Option<Arc<dyn RequestHandler>>,
    host_validate: Option<Arc<dyn HostValidateHandler>>,
    ssdp: Option<Arc<dyn SsdpHandler>>,
}

/// Process-wide server state, passed explicitly to the listener and every
/// worker.
pub struct ServerState {
    pub config: Config,
    pub pool: ThreadPool,
    pub timer: TimerThread,
    pub vdirs: VirtualDirRegistry,
    pub alias: AliasCache,
    handlers: RwLock<Handlers>,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Arc<ServerState>> {
        Self::with_pool_attr(config, ThreadPoolAttr::default())
    }

    pub fn with_pool_attr(config: Config, attr: ThreadPoolAttr) -> Result<Arc<ServerState>> {
        let pool = ThreadPool::new(attr);
        let timer = TimerThread::start(&pool).map_err(|_| Error::InternalError)?;
        let state = Arc::new(ServerState {
            config,
            pool,
            timer,
            vdirs: VirtualDirRegistry::default(),
            alias: AliasCache::default(),
            handlers: RwLock::new(Handlers::default()),
        });
        // The web server is part of the stack itself; SOAP and GENA arrive
        // from outside.
        state.set_web_handler(Some(Arc::new(WebServerHandler)));
        Ok(state)
    }

    pub fn set_soap_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        self.handlers.write().soap = handler;
    }

    pub fn set_gena_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        self.handlers.write().gena = handler;
    }

    pub fn set_web_handler(&self, handler: Option<Arc<dyn RequestHandler>>) {
        self.handlers.write().web = handler;
    }

    pub fn set_host_validate_handler(&self, handler: Option<Arc<dyn HostValidateHandler>>) {
        self.handlers.write().host_validate = handler;
    }

    pub fn set_ssdp_handler(&self, handler: Option<Arc<dyn SsdpHandler>>) {
        self.handlers.write().ssdp = handler;
    }

    pub fn soap_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().soap.clone()
    }

    pub fn gena_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().gena.clone()
    }

    pub fn web_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.read().web.clone()
    }

    pub fn host_validate_handler(&self) -> Option<Arc<dyn HostValidateHandler>> {
        self.handlers.read().host_validate.clone()
    }

    pub fn ssdp_handler(&self) -> Option<Arc<dyn SsdpHandler>> {
        self.handlers.read().ssdp.clone()
    }

    /// Stop the timer, drain the pool and join the workers. The listener
    /// must already be stopped.
    pub fn shutdown(&self) {
        self.timer.shutdown();
        self.pool.shutdown();
    }
}
