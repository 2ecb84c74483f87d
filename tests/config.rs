use std::io::Write;

use pgstatsmon::config::Config;

const FULL_CONFIG: &str = r#"{
    "interval": 10000,
    "connections": {
        "query_timeout": 1000,
        "connect_timeout": 3000,
        "connect_retries": 3,
        "max_connections": 1
    },
    "backend_port": 5432,
    "user": "pgstatsmon",
    "database": "moray",
    "static": {
        "dbs": [
            { "name": "1.postgres.dc1", "ip": "10.0.0.1" },
            { "name": "2.postgres.dc1", "ip": "10.0.0.2" }
        ]
    },
    "vmapi": {
        "url": "http://vmapi.dc1.example.com",
        "pollInterval": 30000,
        "tags": {
            "vm_tag_name": "manta_role",
            "vm_tag_value": "postgres",
            "nic_tag": "^manta$"
        }
    },
    "target": {
        "ip": "0.0.0.0",
        "port": 8881,
        "route": "/metrics",
        "metadata": { "datacenter": "dc1", "service": "postgres" }
    },
    "bootstrap": {
        "user": "postgres"
    },
    "schemata": ["public"]
}"#;

#[test]
fn test_full_config_round_trip() {
    let config: Config = serde_json::from_str(FULL_CONFIG).unwrap();
    config.validate().unwrap();

    assert_eq!(config.interval, 10_000);
    assert_eq!(config.connections.query_timeout, 1_000);
    assert_eq!(config.backend_port, 5_432);
    assert_eq!(config.user, "pgstatsmon");
    assert_eq!(config.database, "moray");
    assert_eq!(config.static_backends.as_ref().unwrap().dbs.len(), 2);
    assert_eq!(
        config.vmapi.as_ref().unwrap().tags.vm_tag_name,
        "manta_role"
    );
    assert_eq!(config.target.metadata["datacenter"], "dc1");
}

#[test]
fn test_config_from_file() {
    let mut file = tempfile_path();
    file.write_all(FULL_CONFIG.as_bytes()).unwrap();
    file.flush().unwrap();

    let config = Config::from_file(&file.path).unwrap();
    assert_eq!(config.interval, 10_000);
}

#[test]
fn test_missing_file_is_config_error() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/pgstatsmon.json")).unwrap_err();
    assert!(err.to_string().contains("invalid configuration"));
}

#[test]
fn test_malformed_json_is_config_error() {
    let mut file = tempfile_path();
    file.write_all(b"{ not json").unwrap();
    file.flush().unwrap();

    assert!(Config::from_file(&file.path).is_err());
}

#[test]
fn test_oversized_pool_rejected() {
    let mut value: serde_json::Value = serde_json::from_str(FULL_CONFIG).unwrap();
    value["connections"]["max_connections"] = serde_json::json!(2);
    let config: Config = serde_json::from_value(value).unwrap();

    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("max_connections"));
}

#[test]
fn test_zero_interval_rejected() {
    let mut value: serde_json::Value = serde_json::from_str(FULL_CONFIG).unwrap();
    value["interval"] = serde_json::json!(0);
    let config: Config = serde_json::from_value(value).unwrap();

    assert!(config.validate().is_err());
}

// Minimal self-cleaning temp file helper.
struct TempFile {
    path: std::path::PathBuf,
    file: std::fs::File,
}

impl TempFile {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn tempfile_path() -> TempFile {
    let path = std::env::temp_dir().join(format!(
        "pgstatsmon-config-test-{}-{:?}.json",
        std::process::id(),
        std::thread::current().id()
    ));
    let file = std::fs::File::create(&path).unwrap();
    TempFile { path, file }
}
