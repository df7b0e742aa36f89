//! Sandbox orchestrator daemon entry point.

use clap::Parser;
use tracing::{error, info};

use sandbox_daemon::config::{Commands, Configuration};
use sandbox_daemon::error::AppError;

mod cmd;

#[tokio::main]
async fn main() {
    let config = Configuration::parse();

    let log_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("sandbox_daemon={log_level}").into()),
        )
        .init();

    info!("starting sandbox orchestrator v{}", env!("CARGO_PKG_VERSION"));

    let result = match config.command.clone() {
        Some(Commands::Diagnostics) => cmd::diagnostics::run().await.map_err(|e| AppError::StartupFailed(e.to_string())),
        Some(Commands::ValidateConfig) => {
            let config = std::sync::Arc::new(config);
            cmd::root::build(&config).await.map(|_| ())
        }
        None => cmd::root::run(config).await,
    };

    if let Err(e) = result {
        error!(error = %e, code = e.code(), "daemon exiting");
        std::process::exit(exit_code(&e));
    }
}

/// Maps the error taxonomy to the daemon's process exit codes:
/// 0 normal shutdown, 1 startup failure (port in use, missing images, runtime
/// unreachable), 2 invalid configuration.
fn exit_code(e: &AppError) -> i32 {
    match e {
        AppError::InvalidConfig(_) => 2,
        AppError::PortInUse(_) | AppError::MissingImages(_) | AppError::DaemonUnavailable(_) => 1,
        _ => 1,
    }
}
