//! HTTP status endpoint
//!
//! Serves a read-only snapshot of the registration ledger for the
//! dashboard collaborator, plus /metrics and /healthz. Everything is
//! answered from in-memory state; no handler touches the network path to
//! either switch.

use crate::error::{RegsyncError, Result};
use crate::metrics::MetricsCollector;
use crate::reconcile::LedgerHandle;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Shared state behind the status endpoints.
pub struct StatusState {
    /// Read-only ledger view published by the engine.
    pub ledger: LedgerHandle,
    /// Metrics collector for /metrics.
    pub metrics: MetricsCollector,
    /// Human-readable monitored scope, for the status payload.
    pub scope: String,
    /// Process start time.
    pub started_at: DateTime<Utc>,
}

/// JSON payload for GET /status.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// DNs currently believed registered with the remote peer, ascending.
    pub registered: Vec<String>,
    /// Number of registered DNs.
    pub count: usize,
    /// Monitored DN scope.
    pub scope: String,
    /// Seconds since process start.
    pub uptime_secs: i64,
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<StatusResponse> {
    let registered: Vec<String> = state
        .ledger
        .snapshot()
        .iter()
        .map(|dn| dn.to_string())
        .collect();
    let count = registered.len();
    Json(StatusResponse {
        registered,
        count,
        scope: state.scope.clone(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<Arc<StatusState>>) -> String {
    state.metrics.gather_metrics()
}

/// Build the status router.
pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Start the status server in a background task.
pub fn spawn_status_server(
    addr: SocketAddr,
    state: Arc<StatusState>,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let app = router(state);
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            RegsyncError::Config(format!("cannot bind status server to {}: {}", addr, e))
        })?;
        info!(addr = %addr, "Status server listening");
        axum::serve(listener, app)
            .await
            .map_err(RegsyncError::Io)?;
        Ok(())
    })
}
