// UPnP miniserver core: the embedded HTTP/1.1 + SSDP multiplexed I/O engine
// of a UPnP device/control-point stack. It accepts inbound requests for
// discovery, description, control and eventing, dispatches them to the
// registered protocol handlers, and serves descriptor documents plus
// virtual-directory content.
//
// SOAP/GENA marshaling, the XML library and the SSDP engine proper are
// external collaborators wired in through the handler traits in `state` and
// `ssdp`.

pub mod builder;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod headers;
pub mod parser;
pub mod server;
pub mod sock;
pub mod ssdp;
pub mod state;
pub mod uri;
pub mod vfs;
pub mod webserver;

use std::sync::Arc;

pub use client::{CancelHandle, ContentLen, HttpConnection, ResponseLength, ResponseMeta};
pub use config::Config;
pub use error::{Error, Result};
pub use server::{MiniServerHandle, Ports};
pub use state::{HostValidateHandler, RequestContext, RequestHandler, ServerState};
pub use vfs::{AliasDoc, Cookie, FileInfo, OpenMode, VirtualDirHandler, VirtualFile};

/// The assembled stack: thread pool, timer and the listener.
pub struct MiniServer {
    state: Arc<ServerState>,
    handle: MiniServerHandle,
}

impl MiniServer {
    /// Start with default port hints (the IANA application port range).
    pub fn start(config: Config) -> Result<MiniServer> {
        MiniServer::start_with_ports(config, 0, 0, 0)
    }

    pub fn start_with_ports(
        config: Config,
        port4: u16,
        port6: u16,
        port6_ula_gua: u16,
    ) -> Result<MiniServer> {
        let state = ServerState::new(config)?;
        match server::start(&state, port4, port6, port6_ula_gua) {
            Ok(handle) => Ok(MiniServer { state, handle }),
            Err(e) => {
                state.shutdown();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn ports(&self) -> Ports {
        self.handle.ports()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Stop the listener via the loopback sentinel, then drain and join the
    /// worker pool.
    pub fn stop(self) -> Result<()> {
        self.handle.stop()?;
        self.state.shutdown();
        Ok(())
    }
}
