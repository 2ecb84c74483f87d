use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use pgstatsmon::metrics::{CONTENT_TYPE, MetricRegistry, exposer};
use tokio::net::TcpListener;

async fn serve_registry(registry: Arc<MetricRegistry>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = exposer::serve(listener, "/metrics", registry).await;
    });
    Ok(format!("http://{addr}"))
}

fn populated_registry() -> Arc<MetricRegistry> {
    let mut fixed = BTreeMap::new();
    fixed.insert("datacenter".to_string(), "dc1".to_string());
    let registry = MetricRegistry::new(&fixed);
    registry
        .add_counter(
            "pg_stat_user_tables_n_tup_ins",
            "Number of rows inserted",
            &["backend", "relname"],
            &["primary.0", "t"],
            3.0,
        )
        .unwrap();
    registry
        .set_gauge(
            "pg_stat_user_tables_n_live_tup",
            "Estimated number of live rows",
            &["backend", "relname"],
            &["primary.0", "t"],
            12.0,
            None,
        )
        .unwrap();
    registry
        .observe(
            "pg_stat_user_tables_querytime_ms",
            "Query wall-clock time in milliseconds",
            &["backend"],
            &["primary.0"],
            8.5,
        )
        .unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn test_scrape_format() -> Result<()> {
    let base = serve_registry(populated_registry()).await?;

    let response = reqwest::get(format!("{base}/metrics")).await?;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some(CONTENT_TYPE)
    );

    let body = response.text().await?;
    assert!(body.contains("# HELP pg_stat_user_tables_n_tup_ins Number of rows inserted"));
    assert!(body.contains("# TYPE pg_stat_user_tables_n_tup_ins counter"));
    assert!(body.contains(
        r#"pg_stat_user_tables_n_tup_ins{backend="primary.0",datacenter="dc1",relname="t"} 3"#
    ));
    assert!(body.contains("# TYPE pg_stat_user_tables_querytime_ms histogram"));

    // Each metric name heads at most one family block.
    let type_lines: Vec<&str> = body
        .lines()
        .filter(|l| l.starts_with("# TYPE pg_stat_user_tables_n_tup_ins"))
        .collect();
    assert_eq!(type_lines.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_scrape_is_read_only() -> Result<()> {
    let base = serve_registry(populated_registry()).await?;

    let first = reqwest::get(format!("{base}/metrics")).await?.text().await?;
    let second = reqwest::get(format!("{base}/metrics")).await?.text().await?;
    assert_eq!(first, second);

    Ok(())
}

#[tokio::test]
async fn test_non_get_method_rejected() -> Result<()> {
    let base = serve_registry(populated_registry()).await?;

    let client = reqwest::Client::new();
    let response = client.post(format!("{base}/metrics")).send().await?;
    assert_eq!(response.status(), 405);

    Ok(())
}

#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let base = serve_registry(populated_registry()).await?;

    let response = reqwest::get(format!("{base}/health")).await?;
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["name"], "pgstatsmon");
    assert!(body["version"].is_string());

    Ok(())
}

#[tokio::test]
async fn test_unknown_route_is_404() -> Result<()> {
    let base = serve_registry(populated_registry()).await?;

    let response = reqwest::get(format!("{base}/nope")).await?;
    assert_eq!(response.status(), 404);

    Ok(())
}
