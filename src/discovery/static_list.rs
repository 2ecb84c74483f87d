//! Static discovery: the configuration enumerates the fleet.

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::config::StaticBackend;
use crate::discovery::DiscoveryEvent;

/// Emit one `Added` per configured entry. Static backends never go away.
pub async fn run(
    entries: Vec<StaticBackend>,
    port: u16,
    database: String,
    tx: mpsc::Sender<DiscoveryEvent>,
) {
    info!(count = entries.len(), "static discovery starting");
    for entry in entries {
        let backend = Backend {
            key: entry.name.clone(),
            display_name: entry.name.clone(),
            address: entry.ip,
            port,
            target_database: database.clone(),
        };
        debug!(key = %entry.name, address = %backend.address, "discovered static backend");
        if tx
            .send(DiscoveryEvent::Added {
                key: entry.name,
                backend,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}
