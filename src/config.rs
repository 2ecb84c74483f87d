use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Top-level configuration, one JSON document.
///
/// `interval`, `user`, and `database` are required; everything else has a
/// default. Either `static` or `vmapi` must configure discovery; when both
/// are present, `vmapi` wins.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Tick period in milliseconds.
    pub interval: u64,
    #[serde(default)]
    pub connections: Connections,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// Monitoring role created by the bootstrapper and reused for polling.
    pub user: String,
    /// Default target database for discovered backends.
    pub database: String,
    #[serde(rename = "static", default)]
    pub static_backends: Option<StaticDiscovery>,
    #[serde(default)]
    pub vmapi: Option<VmapiDiscovery>,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub bootstrap: Bootstrap,
    /// Schema allow-list for relation size metrics.
    #[serde(default = "default_schemata")]
    pub schemata: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Connections {
    /// Per-query deadline, ms.
    #[serde(default = "Connections::default_query_timeout")]
    pub query_timeout: u64,
    /// Per-claim deadline, ms.
    #[serde(default = "Connections::default_connect_timeout")]
    pub connect_timeout: u64,
    /// Reconnect attempts per claim.
    #[serde(default = "Connections::default_connect_retries")]
    pub connect_retries: u32,
    /// Pool size per backend. Anything other than 1 is rejected: the
    /// engine relies on a single live connection per backend.
    #[serde(default = "Connections::default_max_connections")]
    pub max_connections: u32,
}

impl Connections {
    const fn default_query_timeout() -> u64 {
        1_000
    }

    const fn default_connect_timeout() -> u64 {
        3_000
    }

    const fn default_connect_retries() -> u32 {
        3
    }

    const fn default_max_connections() -> u32 {
        1
    }
}

impl Default for Connections {
    fn default() -> Self {
        Self {
            query_timeout: Self::default_query_timeout(),
            connect_timeout: Self::default_connect_timeout(),
            connect_retries: Self::default_connect_retries(),
            max_connections: Self::default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticDiscovery {
    pub dbs: Vec<StaticBackend>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticBackend {
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmapiDiscovery {
    pub url: String,
    /// Inventory poll period, ms.
    #[serde(rename = "pollInterval", default = "VmapiDiscovery::default_poll_interval")]
    pub poll_interval: u64,
    pub tags: VmapiTags,
}

impl VmapiDiscovery {
    const fn default_poll_interval() -> u64 {
        60_000
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VmapiTags {
    pub vm_tag_name: String,
    pub vm_tag_value: String,
    /// Regex matched against NIC tags to pick the address to poll.
    pub nic_tag: String,
}

/// HTTP exposer bind address, scrape path, and fixed labels.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    #[serde(default = "Target::default_ip")]
    pub ip: String,
    #[serde(default = "Target::default_port")]
    pub port: u16,
    #[serde(default = "Target::default_route")]
    pub route: String,
    /// Fixed labels applied to every series (e.g. datacenter).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Target {
    fn default_ip() -> String {
        "0.0.0.0".to_string()
    }

    const fn default_port() -> u16 {
        8_881
    }

    fn default_route() -> String {
        "/metrics".to_string()
    }
}

impl Default for Target {
    fn default() -> Self {
        Self {
            ip: Self::default_ip(),
            port: Self::default_port(),
            route: Self::default_route(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Superuser credentials for first-contact setup. Distinct from the
/// monitoring role in `user`, which the bootstrapper creates.
#[derive(Debug, Clone, Deserialize)]
pub struct Bootstrap {
    #[serde(default = "Bootstrap::default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<SecretString>,
}

impl Bootstrap {
    fn default_user() -> String {
        "postgres".to_string()
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            user: Self::default_user(),
            password: None,
        }
    }
}

const fn default_backend_port() -> u16 {
    5_432
}

fn default_schemata() -> Vec<String> {
    vec!["public".to_string()]
}

impl Config {
    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` on any violation. Fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(Error::Config("interval must be a positive number of ms".into()));
        }
        if self.connections.max_connections != 1 {
            return Err(Error::Config(format!(
                "connections.max_connections must be 1, got {}",
                self.connections.max_connections
            )));
        }
        if self.connections.query_timeout == 0 || self.connections.connect_timeout == 0 {
            return Err(Error::Config("connection timeouts must be positive".into()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Config("user must not be empty".into()));
        }
        if !self
            .user
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Config(format!(
                "user {:?} must match [A-Za-z0-9_]+ (it is interpolated into DDL)",
                self.user
            )));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Config("database must not be empty".into()));
        }
        if self.static_backends.is_none() && self.vmapi.is_none() {
            return Err(Error::Config(
                "at least one of `static` or `vmapi` discovery must be configured".into(),
            ));
        }
        if self.static_backends.is_some() && self.vmapi.is_some() {
            warn!("both static and vmapi discovery configured; vmapi wins");
        }
        if !self.target.route.starts_with('/') {
            return Err(Error::Config(format!(
                "target.route must start with '/', got {:?}",
                self.target.route
            )));
        }
        if self.schemata.is_empty() {
            return Err(Error::Config("schemata must not be empty".into()));
        }
        for key in self.target.metadata.keys() {
            if !is_valid_label_name(key) {
                return Err(Error::Config(format!(
                    "target.metadata key {key:?} is not a valid Prometheus label name"
                )));
            }
        }
        if let Some(vmapi) = &self.vmapi {
            regex::Regex::new(&vmapi.tags.nic_tag).map_err(|e| {
                Error::Config(format!("vmapi.tags.nic_tag is not a valid regex: {e}"))
            })?;
        }
        Ok(())
    }

    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    pub const fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.connections.query_timeout)
    }

    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connections.connect_timeout)
    }
}

pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
