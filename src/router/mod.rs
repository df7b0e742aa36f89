//! Request Surface — HTTP session CRUD, duplex channel upgrade, admin
//! endpoints.
//!
//! Nested `Router` builder, `CorsLayer` + `TraceLayer`, clone-shared
//! `AppState`; the admin subtree sits behind a shared-secret header check
//! applied via middleware, skipped for upgrade requests.

pub mod handlers;
pub mod middleware;
pub mod websocket;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::Router;
use std::net::SocketAddr;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::breaker::CircuitBreaker;
use crate::config::Configuration;
use crate::container::ContainerManager;
use crate::ratelimit::RateLimiter;
use crate::reaper::Reaper;
use crate::registry::EnvironmentRegistry;
use crate::session::SessionManager;

/// Shared application state, cloned (cheaply, behind `Arc`s) into every
/// handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<EnvironmentRegistry>,
    pub containers: Arc<ContainerManager>,
    pub sessions: Arc<SessionManager>,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub reaper: Arc<Reaper>,
    pub config: Arc<Configuration>,
    pub started_at: std::time::Instant,
}

/// Derives the stable per-caller identity used for rate-limit keys: the
/// first forwarded-address header if present, else the socket peer address.
pub fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = value.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.map(|a| a.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/containers", get(handlers::admin::list_containers))
        .route("/containers/:id", get(handlers::admin::get_container))
        .route("/containers/:id/restart", post(handlers::admin::restart_container))
        .route("/containers/:id/stop", post(handlers::admin::stop_container))
        .route("/containers/:id", delete(handlers::admin::remove_container))
        .route("/containers/:id/logs", get(handlers::admin::container_logs))
        .route("/rate-limits", get(handlers::admin::list_rate_limits))
        .route("/rate-limits/:client_id", get(handlers::admin::get_rate_limit))
        .route("/rate-limits/:client_id/reset", post(handlers::admin::reset_rate_limit))
        .route("/rate-limits/:client_id/adjust", post(handlers::admin::adjust_rate_limit))
        .route("/metrics/system", get(handlers::admin::metrics_system))
        .route("/metrics/sandbox", get(handlers::admin::metrics_sandbox))
        .route("/metrics/rate-limits", get(handlers::admin::metrics_rate_limits))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth::require_admin_header));

    let api_routes = Router::new()
        .route("/environments", get(handlers::sessions::list_environments))
        .route("/sessions", post(handlers::sessions::create_session))
        .route("/sessions/:id", get(handlers::sessions::get_session))
        .route("/sessions/:id", delete(handlers::sessions::delete_session))
        .route("/sessions/:id/channel", get(websocket::channel_upgrade));

    // Admin is a top-level subtree (`/admin/*`), not nested under `/api/v1` —
    // it's the one noted exception to the base-path convention.
    Router::new()
        .route("/health", get(handlers::status::health))
        .route("/status", get(handlers::status::status))
        .nest("/api/v1", api_routes)
        .nest("/admin", admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
