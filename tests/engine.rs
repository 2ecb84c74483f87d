use pgstatsmon::backend::Backend;
use pgstatsmon::config::Config;
use pgstatsmon::discovery::DiscoveryEvent;
use pgstatsmon::engine::{Engine, FANOUT};

fn config(port: u16) -> Config {
    serde_json::from_value(serde_json::json!({
        "interval": 60000,
        "user": "pgstatsmon",
        "database": "postgres",
        // The discard port: nothing answers, so setup fails fast and the
        // tests never depend on a live Postgres.
        "backend_port": 9,
        "connections": {
            "connect_timeout": 500,
            "connect_retries": 0
        },
        "static": { "dbs": [ { "name": "primary.0", "ip": "127.0.0.1" } ] },
        "target": { "ip": "127.0.0.1", "port": port, "metadata": { "datacenter": "dc1" } }
    }))
    .unwrap()
}

fn backend(key: &str) -> Backend {
    Backend {
        key: key.to_string(),
        display_name: format!("{key}.postgres"),
        address: "127.0.0.1".to_string(),
        port: 9,
        target_database: "postgres".to_string(),
    }
}

#[test]
fn test_fanout_cap_is_ten() {
    assert_eq!(FANOUT, 10);
}

#[tokio::test]
async fn test_discovery_events_drive_backend_registry() {
    let engine = Engine::new(config(0)).unwrap();

    for i in 0..3 {
        let key = format!("b{i}");
        engine
            .handle_event(DiscoveryEvent::Added {
                key: key.clone(),
                backend: backend(&key),
            })
            .await;
    }
    assert_eq!(engine.backend_count().await, 3);

    engine
        .handle_event(DiscoveryEvent::Removed { key: "b1".into() })
        .await;
    assert_eq!(engine.backend_count().await, 2);
    assert!(engine.backend("b1").await.is_none());
    assert!(engine.backend("b0").await.is_some());
}

#[tokio::test]
async fn test_unprepared_backend_contributes_nothing() {
    let engine = Engine::new(config(0)).unwrap();
    engine
        .handle_event(DiscoveryEvent::Added {
            key: "b0".into(),
            backend: backend("b0"),
        })
        .await;

    // Setup cannot succeed against the discard port, so the backend stays
    // unprepared and the tick completes without touching it.
    engine.tick().await;

    let state = engine.backend("b0").await.unwrap();
    assert!(state.needs_setup());

    let body = engine.metrics().render().unwrap();
    assert!(!body.contains("pg_stat_user_tables"));
}

#[tokio::test]
async fn test_engine_start_serves_scrape_endpoint() -> anyhow::Result<()> {
    let engine = Engine::new(config(0))?;
    let addr = engine.start().await?;

    let response = reqwest::get(format!("http://{addr}/metrics")).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/plain; version=0.0.4")
    );

    engine.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let engine = Engine::new(config(0)).unwrap();
    let _ = engine.start().await.unwrap();
    engine.stop().await;
    engine.stop().await;
}
