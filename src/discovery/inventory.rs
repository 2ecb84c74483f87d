//! Fleet-inventory discovery.
//!
//! Polls a VMAPI-style HTTP service for running instances carrying the
//! configured tag, picks each instance's address from the NIC whose tag
//! matches `nic_tag`, and diffs successive responses into `Added` and
//! `Removed` events. A failed poll keeps the previous view intact.

use std::collections::HashMap;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::VmapiDiscovery;
use crate::discovery::DiscoveryEvent;

#[derive(Debug, Deserialize)]
struct Vm {
    uuid: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    nics: Vec<Nic>,
}

#[derive(Debug, Deserialize)]
struct Nic {
    #[serde(default)]
    nic_tag: Option<String>,
    #[serde(default)]
    ip: Option<String>,
}

pub async fn run(
    config: VmapiDiscovery,
    port: u16,
    database: String,
    tx: mpsc::Sender<DiscoveryEvent>,
) {
    let nic_tag = match Regex::new(&config.tags.nic_tag) {
        Ok(regex) => regex,
        Err(error) => {
            // Config validation rejects this before startup.
            error!(%error, "invalid nic_tag regex, inventory discovery disabled");
            return;
        }
    };

    let client = reqwest::Client::new();
    let mut known: HashMap<String, Backend> = HashMap::new();

    info!(url = %config.url, "inventory discovery starting");
    let mut ticker = time::interval(Duration::from_millis(config.poll_interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let vms = match poll(&client, &config).await {
            Ok(vms) => vms,
            Err(error) => {
                warn!(%error, "inventory poll failed; keeping previous view");
                continue;
            }
        };

        let mut current = HashMap::new();
        for vm in vms {
            match select_backend(&vm, &nic_tag, port, &database) {
                Some(backend) => {
                    current.insert(vm.uuid.clone(), backend);
                }
                None => {
                    debug!(uuid = %vm.uuid, "no NIC matched, skipping instance");
                }
            }
        }

        for (key, backend) in &current {
            if !known.contains_key(key) {
                info!(key = %key, name = %backend.display_name, "backend added");
                if tx
                    .send(DiscoveryEvent::Added {
                        key: key.clone(),
                        backend: backend.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
        for key in known.keys() {
            if !current.contains_key(key) {
                info!(key = %key, "backend removed");
                if tx
                    .send(DiscoveryEvent::Removed { key: key.clone() })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }

        known = current;
    }
}

async fn poll(client: &reqwest::Client, config: &VmapiDiscovery) -> anyhow::Result<Vec<Vm>> {
    let url = format!(
        "{}/vms?state=running&tag.{}={}",
        config.url.trim_end_matches('/'),
        config.tags.vm_tag_name,
        config.tags.vm_tag_value
    );
    let vms = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<Vm>>()
        .await?;
    Ok(vms)
}

fn select_backend(vm: &Vm, nic_tag: &Regex, port: u16, database: &str) -> Option<Backend> {
    let address = vm
        .nics
        .iter()
        .find(|nic| {
            nic.nic_tag
                .as_deref()
                .is_some_and(|tag| nic_tag.is_match(tag))
        })
        .and_then(|nic| nic.ip.clone())?;

    let display_name = vm.alias.clone().unwrap_or_else(|| vm.uuid.clone());
    Some(Backend {
        key: vm.uuid.clone(),
        display_name,
        address,
        port,
        target_database: database.to_string(),
    })
}
