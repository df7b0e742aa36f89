//! Main daemon command — assembles every component in a fixed order
//! (Registry -> ContainerManager + image validation -> RateLimiter -> Breaker
//! -> SessionManager -> Reaper -> Request Surface) and serves the
//! HTTP/duplex-channel surface until shutdown. Shutdown reverses the order:
//! stop admitting, destroy live sessions (closing channels, removing their
//! containers), then let the HTTP listener drain.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sandbox_daemon::breaker::CircuitBreaker;
use sandbox_daemon::config::Configuration;
use sandbox_daemon::container::ContainerManager;
use sandbox_daemon::error::{AppError, Result};
use sandbox_daemon::ratelimit::RateLimiter;
use sandbox_daemon::registry::EnvironmentRegistry;
use sandbox_daemon::router::{self, AppState};
use sandbox_daemon::session::SessionManager;

/// Build every component up through registry image validation, without
/// starting the HTTP listener. Shared by `run` and the `validate-config`
/// subcommand (the exit-code contract: 2 invalid config, 1 missing
/// images / unreachable daemon).
pub async fn build(config: &Arc<Configuration>) -> Result<(Arc<EnvironmentRegistry>, Arc<ContainerManager>)> {
    info!(dir = ?config.environments_dir, "loading environment registry");
    let registry = Arc::new(EnvironmentRegistry::load(config.environments_dir.as_deref())?);

    info!(socket = %config.runtime_socket, "connecting to container runtime");
    let containers = Arc::new(ContainerManager::connect(&config.runtime_socket)?);
    containers.ping().await?;

    registry.validate_all(&containers).await?;
    info!(count = registry.list().len(), "environment images validated");

    Ok((registry, containers))
}

/// Run the daemon until a shutdown signal is received.
pub async fn run(config: Configuration) -> Result<()> {
    let config = Arc::new(config);
    let (registry, containers) = build(&config).await?;

    let rate_limiter = Arc::new(RateLimiter::new(&config));
    let breaker = Arc::new(CircuitBreaker::new(
        containers.clone(),
        config.service_prefix.clone(),
        config.max_containers,
        config.max_memory_percent,
        Duration::from_millis(config.breaker_cooldown_ms),
    ));

    let shutdown = CancellationToken::new();
    breaker
        .clone()
        .spawn_sampler(Duration::from_millis(config.breaker_sample_interval_ms()), shutdown.clone());

    let sessions = Arc::new(SessionManager::new(
        registry.clone(),
        containers.clone(),
        rate_limiter.clone(),
        breaker.clone(),
        config.clone(),
    ));

    let reaper = sessions.start_cleanup_scheduler(
        containers.clone(),
        Duration::from_millis(config.cleanup_interval_ms),
        Duration::from_millis(config.max_container_age_ms),
        shutdown.clone(),
    );

    let state = AppState {
        registry,
        containers: containers.clone(),
        sessions: sessions.clone(),
        rate_limiter,
        breaker,
        reaper,
        config: config.clone(),
        started_at: std::time::Instant::now(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| AppError::StartupFailed(format!("invalid bind address: {e}")))?;

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_token = shutdown.clone();
    let sessions_shutdown = sessions.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to install SIGINT handler");
            return;
        }
        warn!("shutdown signal received, destroying live sessions");

        // Reverse startup order: stop the background tasks first so no new
        // sweep/sample races the teardown below, then destroy every session
        // (closes its channel, stops+removes its container), then drain HTTP.
        shutdown_token.cancel();
        for id in sessions_shutdown.all_ids() {
            if let Err(e) = sessions_shutdown.destroy(id, "daemon shutdown").await {
                warn!(session = %id, error = %e, "failed to destroy session during shutdown");
            }
        }

        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!(%bind_addr, "sandbox orchestrator listening");
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| {
            if e.to_string().contains("Address already in use") {
                AppError::PortInUse(bind_addr.to_string())
            } else {
                AppError::StartupFailed(e.to_string())
            }
        })?;

    info!("daemon stopped");
    Ok(())
}
