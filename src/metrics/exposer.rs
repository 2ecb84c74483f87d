//! HTTP scrape endpoint.
//!
//! Serves the most recently observed values; it never triggers collection.
//! `GET <route>` returns the Prometheus text format, anything but GET gets
//! a 405 from the method router.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, debug_span, error, info, instrument, warn};
use ulid::Ulid;

use crate::metrics::{CONTENT_TYPE, MetricRegistry};

const BIND_ATTEMPTS: u32 = 3;

/// Build the exposer router for the configured scrape route.
pub fn router(route: &str, registry: Arc<MetricRegistry>) -> Router {
    Router::new()
        .route(route, get(metrics))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(registry)),
        )
}

/// Bind the scrape listener, retrying a few times before giving up.
///
/// # Errors
///
/// Returns an error once every bind attempt has failed.
pub async fn bind(ip: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{ip}:{port}");
    let mut last_err = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                info!(%addr, "scrape endpoint listening");
                return Ok(listener);
            }
            Err(error) => {
                warn!(%addr, attempt, %error, "failed to bind scrape endpoint, retrying");
                last_err = Some(error);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    Err(last_err.expect("at least one bind attempt"))
        .with_context(|| format!("failed to bind scrape endpoint on {addr}"))
}

/// Serve until the task is aborted.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, route: &str, registry: Arc<MetricRegistry>) -> Result<()> {
    let app = router(route, registry);
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[instrument(skip(registry), fields(http.route = "/metrics"))]
async fn metrics(Extension(registry): Extension<Arc<MetricRegistry>>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    match registry.render() {
        Ok(body) => {
            headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE));
            (StatusCode::OK, headers, body)
        }
        Err(error) => {
            error!(%error, "failed to render metrics");
            headers.insert("content-type", HeaderValue::from_static("text/plain"));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                headers,
                format!("failed to render metrics: {error}"),
            )
        }
    }
}

#[derive(Serialize)]
struct Health {
    name: &'static str,
    version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<&'static str>,
}

async fn health() -> impl IntoResponse {
    Json(Health {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        commit: crate::built_info::GIT_COMMIT_HASH,
    })
}

fn make_span(request: &Request<Body>) -> Span {
    let path = request.uri().path();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, request_id)
}
