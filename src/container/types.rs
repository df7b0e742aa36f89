//! Data types exchanged with the Container Manager.

use std::collections::HashMap;

use serde::Serialize;

/// Resource caps applied to every created container. Defaults chosen to keep
/// a single sandbox cheap; callers may not raise them, only the operator's
/// process configuration can.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            pids_limit: 128,
        }
    }
}

/// Everything the Container Manager needs to create a hardened sandbox
/// container for one session.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub session_id: String,
    pub environment: String,
    pub tool_pair: Option<String>,
    pub created_at_epoch_ms: u64,
    pub env: HashMap<String, String>,
    pub working_dir: String,
    pub uid_gid: String,
    pub limits: ResourceLimits,
    pub service_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Restarting,
    Running,
    Paused,
    Exited,
    Dead,
    Stopped,
}

impl From<&str> for ContainerStatus {
    fn from(s: &str) -> Self {
        match s {
            "created" => ContainerStatus::Created,
            "restarting" => ContainerStatus::Restarting,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: ContainerStatus,
    pub created_at_epoch_ms: u64,
    pub started_at_epoch_ms: Option<u64>,
    pub session_id: Option<String>,
    pub environment_name: Option<String>,
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

/// Conjunctive filter for `ContainerManager::list`.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub status: Option<ContainerStatus>,
    pub environment: Option<String>,
    pub tool_pair: Option<String>,
    pub older_than_epoch_ms: Option<u64>,
}
