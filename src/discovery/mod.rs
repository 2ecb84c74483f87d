//! Backend discovery.
//!
//! A provider is an event stream: `Added` fires once per observed backend,
//! `Removed` when it leaves. Two providers are bundled; only one runs per
//! process, and the fleet inventory provider wins when both are
//! configured.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backend::Backend;
use crate::config::Config;

pub mod inventory;
pub mod static_list;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Added { key: String, backend: Backend },
    Removed { key: String },
}

/// Start the configured provider and return its event stream.
pub fn spawn(config: &Config) -> (mpsc::Receiver<DiscoveryEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let handle = if let Some(vmapi) = config.vmapi.clone() {
        if config.static_backends.is_some() {
            warn!("both static and vmapi discovery configured; using vmapi");
        }
        let port = config.backend_port;
        let database = config.database.clone();
        tokio::spawn(async move {
            inventory::run(vmapi, port, database, tx).await;
        })
    } else {
        let entries = config
            .static_backends
            .as_ref()
            .map(|s| s.dbs.clone())
            .unwrap_or_default();
        let port = config.backend_port;
        let database = config.database.clone();
        tokio::spawn(async move {
            static_list::run(entries, port, database, tx).await;
        })
    };

    (rx, handle)
}
