/// HTTP surface - node telemetry ingestion, status, metrics
///
/// Validators POST their telemetry reports here; the handler stamps the
/// client IP and receive time and upserts the node row. The status and
/// metrics endpoints serve the explorer frontend and Prometheus scrapes.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::metrics;
use crate::store::ChainStore;
use crate::types::{NodeRecord, TelemetryReport};

#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub max_block_height: Option<u64>,
    pub min_block_height: Option<u64>,
    pub node_count: u64,
}

pub async fn serve(addr: SocketAddr, store: Arc<dyn ChainStore>) {
    // Configure CORS to allow requests from the frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .route("/nodes", post(node_telemetry_handler))
        .layer(cors)
        .layer(Extension(store));

    let listener = tokio::net::TcpListener::bind(addr).await.expect("Failed to bind");
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server failed");
}

async fn status_handler(
    Extension(store): Extension<Arc<dyn ChainStore>>,
) -> Result<Json<StatusSummary>, (StatusCode, Json<ApiError>)> {
    let max_block_height = store.max_block_height().await.map_err(internal_error)?;
    let min_block_height = store.min_block_height().await.map_err(internal_error)?;
    let node_count = store.node_count().await.map_err(internal_error)?;
    Ok(Json(StatusSummary {
        max_block_height,
        min_block_height,
        node_count,
    }))
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

/// POST /nodes
/// Upserts the reporting node's row, stamped with the client IP and the
/// receive time. Returns `{}`, or the handling time when the request
/// carries a `debug` query parameter.
async fn node_telemetry_handler(
    Extension(store): Extension<Arc<dyn ChainStore>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    axum::extract::Query(params): axum::extract::Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(report): Json<TelemetryReport>,
) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
    let started = Instant::now();
    let ip_address = client_ip(&headers, peer);
    let record = NodeRecord::from_report(report, ip_address, current_millis());
    metrics::TELEMETRY_REPORTS.inc();
    if let Err(err) = store.upsert_node(&record).await {
        warn!(node_id = %record.node_id, "node telemetry upsert failed: {}", err);
        return Err(internal_error(err));
    }
    if params.contains_key("debug") {
        Ok(Json(serde_json::json!({
            "forward_ms": started.elapsed().as_millis() as u64
        })))
    } else {
        Ok(Json(serde_json::json!({})))
    }
}

/// Proxied requests carry the original client in X-Forwarded-For as a
/// comma-separated list; the first entry is the client. Direct requests
/// fall back to the TCP peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: err.to_string(),
        }),
    )
}
