use std::time::SystemTime;

use anyhow::Context;
use tracing::info;
use upnp_miniserver::{AliasDoc, Config, MiniServer};

fn main() -> anyhow::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        unsafe { std::env::set_var("RUST_LOG", "debug") };
    }
    tracing_subscriber::fmt::init();

    let root = std::env::args()
        .nth(1)
        .context("usage: serve-dir <document-root>")?;

    let server = MiniServer::start(Config {
        document_root: Some(root.clone().into()),
        ..Default::default()
    })
    .context("error starting miniserver")?;

    server.state().alias.set(Some(AliasDoc {
        name: "/description.xml".to_owned(),
        doc: b"<?xml version=\"1.0\"?><root xmlns=\"urn:schemas-upnp-org:device-1-0\"/>\n".to_vec(),
        last_modified: SystemTime::now(),
    }))?;

    let ports = server.ports();
    info!(root, port4 = ports.port4, "serving; Ctrl-C to exit");

    loop {
        std::thread::park();
    }
}
