//! Admin subtree: container operations, rate-limit inspection/reset, and
//! metrics projections. Segregated under the top-level `/admin/*`,
//! authenticated by `middleware::auth::require_admin_header`.
//!
//! Handler shapes mirror the usual list/get/restart/stop/remove/logs set
//! over a container runtime, scoped here by `ContainerManager` +
//! service-label filtering.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::container::{ContainerFilter, ContainerInfo, ContainerStatus};
use crate::error::{AppError, Result};
use crate::ratelimit::{AdjustParams, ClientTrackingView};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct ContainerListQuery {
    pub status: Option<String>,
    #[serde(rename = "toolPair")]
    pub tool_pair: Option<String>,
    #[serde(rename = "olderThan")]
    pub older_than: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ContainersResponse {
    pub containers: Vec<ContainerInfo>,
}

fn parse_status(s: &str) -> Result<ContainerStatus> {
    Ok(match s {
        "created" => ContainerStatus::Created,
        "restarting" => ContainerStatus::Restarting,
        "running" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "exited" => ContainerStatus::Exited,
        "dead" => ContainerStatus::Dead,
        "stopped" => ContainerStatus::Stopped,
        other => return Err(AppError::InvalidRequest(format!("unknown status filter: {other}"))),
    })
}

pub async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ContainerListQuery>,
) -> Result<Json<ContainersResponse>> {
    let filter = ContainerFilter {
        status: query.status.as_deref().map(parse_status).transpose()?,
        environment: None,
        tool_pair: query.tool_pair,
        older_than_epoch_ms: query.older_than,
    };
    let containers = state.containers.list(&state.config.service_prefix, filter).await?;
    let mut hydrated = Vec::with_capacity(containers.len());
    for info in containers {
        hydrated.push(with_live_stats(&state, info).await);
    }
    Ok(Json(ContainersResponse { containers: hydrated }))
}

/// Merges a fresh one-shot stats sample onto an inspect result. Stats
/// collection is best-effort — a stopped container has nothing to sample,
/// and a transient daemon error here degrades to a zeroed reading rather
/// than failing the whole request (stats are a non-essential read).
async fn with_live_stats(state: &AppState, mut info: ContainerInfo) -> ContainerInfo {
    if info.status != ContainerStatus::Running {
        return info;
    }
    if let Ok(stats) = state.containers.stats(&info.id).await {
        info.cpu_percent = stats.cpu_percent;
        info.memory_usage = stats.memory_usage;
        info.memory_limit = stats.memory_limit;
        info.memory_percent = if stats.memory_limit > 0 {
            stats.memory_usage as f64 / stats.memory_limit as f64 * 100.0
        } else {
            0.0
        };
    }
    info
}

pub async fn get_container(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<ContainerInfo>> {
    let info = state.containers.inspect(&id).await?;
    Ok(Json(with_live_stats(&state, info).await))
}

pub async fn restart_container(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.containers.restart(&id, Duration::from_secs(5)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_container(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.containers.stop(&id, Duration::from_secs(5)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    pub force: Option<bool>,
}

pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode> {
    state.containers.remove(&id, query.force.unwrap_or(false)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<i64>,
}

pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String> {
    let tail = query.tail.unwrap_or(100);
    if tail < 0 {
        return Err(AppError::InvalidRequest("tail must be a non-negative integer".into()));
    }
    const MAX_TAIL: i64 = 10_000;
    let tail = tail.min(MAX_TAIL) as u32;
    state.containers.logs(&id, tail).await
}

#[derive(Debug, Serialize)]
pub struct RateLimitsResponse {
    #[serde(rename = "rateLimits")]
    pub rate_limits: Vec<ClientTrackingView>,
}

pub async fn list_rate_limits(State(state): State<AppState>) -> Json<RateLimitsResponse> {
    Json(RateLimitsResponse { rate_limits: state.rate_limiter.list_status() })
}

pub async fn get_rate_limit(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<Json<ClientTrackingView>> {
    state
        .rate_limiter
        .status(&client_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("client {client_id}")))
}

pub async fn reset_rate_limit(State(state): State<AppState>, Path(client_id): Path<String>) -> Result<StatusCode> {
    if state.rate_limiter.reset(&client_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("client {client_id}")))
    }
}

#[derive(Debug, Deserialize)]
pub struct AdjustBody {
    #[serde(rename = "windowDuration")]
    pub window_duration: Option<u64>,
    #[serde(rename = "maxRequests")]
    pub max_requests: Option<u32>,
}

pub async fn adjust_rate_limit(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(body): Json<AdjustBody>,
) -> Result<Json<ClientTrackingView>> {
    state
        .rate_limiter
        .adjust(
            &client_id,
            AdjustParams { window_duration_ms: body.window_duration, max_requests: body.max_requests },
        )
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("client {client_id}")))
}

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub uptime_secs: u64,
    pub cpu_count: usize,
}

pub async fn metrics_system(State(state): State<AppState>) -> Json<SystemMetrics> {
    Json(SystemMetrics { uptime_secs: state.started_at.elapsed().as_secs(), cpu_count: num_cpus::get() })
}

#[derive(Debug, Serialize)]
pub struct SandboxMetrics {
    pub sessions: crate::session::SessionManagerStats,
    pub circuit: crate::breaker::CircuitSnapshot,
    pub reaper: crate::reaper::SweepStats,
}

pub async fn metrics_sandbox(State(state): State<AppState>) -> Json<SandboxMetrics> {
    Json(SandboxMetrics {
        sessions: state.sessions.stats(),
        circuit: state.breaker.status(),
        reaper: state.reaper.stats(),
    })
}

pub async fn metrics_rate_limits(State(state): State<AppState>) -> Json<RateLimitsResponse> {
    Json(RateLimitsResponse { rate_limits: state.rate_limiter.list_status() })
}
