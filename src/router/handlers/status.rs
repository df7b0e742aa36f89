//! Liveness and admission-status surfaces.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::breaker::CircuitMetrics;
use crate::router::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub uptime: u64,
    pub sessions: usize,
}

/// `GET /health` — no authentication, cheap, no daemon round-trip.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs(),
        sessions: state.sessions.stats().total,
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(rename = "isOpen")]
    pub is_open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub metrics: CircuitMetrics,
}

/// `GET /status` — polled by clients to render "sandbox unavailable" UI.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.breaker.status();
    Json(StatusResponse {
        is_open: snapshot.state != crate::breaker::BreakerState::Closed,
        reason: snapshot.reason,
        metrics: snapshot.metrics,
    })
}
