//! Operational HTTP surface
//!
//! Two listeners: the metrics port serves the Prometheus exposition, the
//! health port serves liveness, store-gated readiness and a JSON counter
//! snapshot for quick inspection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

use crate::correlator::Correlator;
use crate::ingestor::IngestStats;
use crate::persister::Persister;

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    let families = registry.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).to_string())
}

/// Serve `GET /metrics`. Returns the actually bound address so callers can
/// pass port 0 in tests.
pub async fn start_metrics_server(addr: SocketAddr, registry: Registry) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(registry));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener on {}", addr))?;
    let local = listener.local_addr()?;
    info!("metrics listening on {}", local);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(local)
}

#[derive(Clone)]
pub struct HealthState {
    pub persister: Arc<Persister>,
    pub ingest_stats: Arc<IngestStats>,
    pub correlator: Arc<Correlator>,
    pub started_at: Instant,
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    if state.persister.health_check().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn stats_handler(State(state): State<HealthState>) -> Json<serde_json::Value> {
    let window = state.correlator.stats_snapshot().await;
    Json(serde_json::json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "ingest": state.ingest_stats.snapshot(),
        "window": window,
    }))
}

/// Serve `GET /health`, `GET /ready` and `GET /stats`.
pub async fn start_health_server(addr: SocketAddr, state: HealthState) -> Result<SocketAddr> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/stats", get(stats_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind health listener on {}", addr))?;
    let local = listener.local_addr()?;
    info!("health listening on {}", local);
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    Ok(local)
}
