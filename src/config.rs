//! Process configuration, loaded from CLI flags and environment variables.
//!
//! Built with `clap`'s derive + `env` features the same way the upstream
//! daemon wires its configuration, but flattened to a single struct since
//! this service has no on-disk config file of its own (static configuration
//! loading is an external concern).

use clap::Parser;

fn default_service_prefix() -> String {
    "sandbox".to_string()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sandbox-daemon")]
#[command(about = "Multi-tenant sandbox orchestrator")]
#[command(version)]
pub struct Configuration {
    /// Port the HTTP/duplex-channel surface listens on.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Address the HTTP surface binds to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Origin allowed to open duplex channels (CORS); `*` allows any.
    #[arg(long, env = "FRONTEND_ORIGIN", default_value = "*")]
    pub frontend_origin: String,

    /// Path to the container runtime's control socket.
    #[arg(long, env = "RUNTIME_SOCKET", default_value = "/var/run/docker.sock")]
    pub runtime_socket: String,

    /// Label prefix stamped on every container this process creates.
    #[arg(long, env = "SERVICE_PREFIX", default_value_t = default_service_prefix())]
    pub service_prefix: String,

    /// Rate limiter: concurrent sessions per client.
    #[arg(long, env = "MAX_CONCURRENT_SESSIONS", default_value_t = 2)]
    pub max_concurrent_sessions: u32,

    /// Rate limiter: session creations per client per rolling hour.
    #[arg(long, env = "SESSIONS_PER_HOUR", default_value_t = 50)]
    pub sessions_per_hour: u32,

    /// Rate limiter: inbound channel messages per client per rolling minute.
    #[arg(long, env = "COMMANDS_PER_MINUTE", default_value_t = 60)]
    pub commands_per_minute: u32,

    /// Rate limiter: concurrent live channels per client.
    #[arg(long, env = "MAX_CONCURRENT_CHANNELS", default_value_t = 3)]
    pub max_concurrent_channels: u32,

    /// Circuit breaker: running-container ceiling.
    #[arg(long, env = "MAX_CONTAINERS", default_value_t = 100)]
    pub max_containers: u64,

    /// Circuit breaker: host memory utilisation ceiling, percent.
    #[arg(long, env = "MAX_MEMORY_PERCENT", default_value_t = 90.0)]
    pub max_memory_percent: f32,

    /// Circuit breaker: Open → HalfOpen cooldown, milliseconds.
    #[arg(long, env = "BREAKER_COOLDOWN_MS", default_value_t = 30_000)]
    pub breaker_cooldown_ms: u64,

    /// Reaper sweep interval, milliseconds.
    #[arg(long, env = "CLEANUP_INTERVAL_MS", default_value_t = 60_000)]
    pub cleanup_interval_ms: u64,

    /// Maximum lifetime for an orphaned (session-less) container, milliseconds.
    #[arg(long, env = "MAX_CONTAINER_AGE_MS", default_value_t = 3_600_000)]
    pub max_container_age_ms: u64,

    /// Bypass rate-limit/breaker admission but keep counting (local dev only).
    #[arg(long, env = "DEVELOPMENT_MODE", default_value_t = false)]
    pub development_mode: bool,

    /// Shared secret the admin subtree expects in its auth header.
    /// Authentication of the caller itself happens upstream (reverse proxy);
    /// this is only a defense-in-depth check that the proxy passed through.
    #[arg(long, env = "ADMIN_SHARED_HEADER")]
    pub admin_shared_header: Option<String>,

    /// Directory of TOML environment-definition fragments to layer on top of
    /// the built-in environment set (see `registry`).
    #[arg(long, env = "ENVIRONMENTS_DIR")]
    pub environments_dir: Option<String>,

    /// Enable debug-level logging.
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print host/runtime-daemon diagnostics for operators debugging a node.
    Diagnostics,
    /// Load configuration and validate the environment registry's images
    /// without starting the HTTP listener (exit 2 invalid config, 1 missing
    /// images / unreachable daemon).
    ValidateConfig,
}

impl Configuration {
    pub fn session_timeout_cap_ms(&self) -> u64 {
        30 * 60 * 1000
    }

    pub fn attach_grace_ms(&self) -> u64 {
        60_000
    }

    pub fn init_timeout_ms(&self) -> u64 {
        30_000
    }

    pub fn creation_deadline_ms(&self) -> u64 {
        30_000
    }

    pub fn breaker_sample_interval_ms(&self) -> u64 {
        15_000
    }
}
