//! Reaper — periodic background sweep enforcing session and container
//! lifecycle invariants; the final line of defence against leaked sessions
//! and orphaned containers.
//!
//! Iterates and acts on entities sequentially, the same shape as a
//! shutdown drain, generalized to a periodic `tokio::time::interval` loop.
//! A `tokio::sync::Mutex` try-lock guards against two concurrent sweeps
//! overlapping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{ContainerFilter, ContainerManager, ContainerStatus};
use crate::session::SessionManager;

#[derive(Debug, Default, Serialize)]
pub struct SweepStats {
    pub removed_sessions: u64,
    pub removed_containers: u64,
    pub errors: u64,
    pub last_run_epoch_ms: u64,
}

pub struct Reaper {
    sessions: Arc<SessionManager>,
    containers: Arc<ContainerManager>,
    service_prefix: String,
    max_container_age: Duration,
    sweep_lock: Mutex<()>,
    removed_sessions: AtomicU64,
    removed_containers: AtomicU64,
    errors: AtomicU64,
    last_run_epoch_ms: AtomicU64,
}

impl Reaper {
    pub fn new(
        sessions: Arc<SessionManager>,
        containers: Arc<ContainerManager>,
        service_prefix: String,
        max_container_age: Duration,
    ) -> Self {
        Self {
            sessions,
            containers,
            service_prefix,
            max_container_age,
            sweep_lock: Mutex::new(()),
            removed_sessions: AtomicU64::new(0),
            removed_containers: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_run_epoch_ms: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SweepStats {
        SweepStats {
            removed_sessions: self.removed_sessions.load(Ordering::Relaxed),
            removed_containers: self.removed_containers.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_run_epoch_ms: self.last_run_epoch_ms.load(Ordering::Relaxed),
        }
    }

    /// One sweep: step 1 (session invariants) then step 2 (orphan
    /// containers), never run concurrently with another sweep.
    pub async fn sweep(&self) {
        let Ok(_guard) = self.sweep_lock.try_lock() else {
            debug!("reaper sweep already in progress, skipping tick");
            return;
        };

        let session_counts = self.sessions.sweep().await;
        self.removed_sessions.fetch_add(session_counts.destroyed as u64, Ordering::Relaxed);
        self.errors.fetch_add(session_counts.errors as u64, Ordering::Relaxed);

        let mut removed_containers = 0u64;
        let mut errors = 0u64;
        match self.containers.list(&self.service_prefix, ContainerFilter::default()).await {
            Ok(containers) => {
                for container in containers {
                    // Every service container carries a `sessionId` label
                    // (docker.rs), so the label is present whether or not its
                    // session is still alive — orphan status has to be
                    // resolved against the live session map, not the mere
                    // presence of the label. A missing/malformed label is
                    // treated as orphaned too.
                    let owning_session_alive = container
                        .session_id
                        .as_deref()
                        .and_then(|s| Uuid::parse_str(s).ok())
                        .is_some_and(|id| self.sessions.get(id).is_some());
                    if owning_session_alive {
                        continue;
                    }
                    let age_ms = chrono::Utc::now().timestamp_millis() as u64
                        - container.created_at_epoch_ms;
                    let too_old = age_ms > self.max_container_age.as_millis() as u64;
                    let dead = matches!(container.status, ContainerStatus::Exited | ContainerStatus::Dead);
                    if too_old || dead {
                        match self.containers.remove(&container.id, true).await {
                            Ok(()) => removed_containers += 1,
                            Err(e) => {
                                warn!(container = %container.id, error = %e, "reaper: failed to remove orphan container");
                                errors += 1;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "reaper: failed to list containers");
                errors += 1;
            }
        }

        self.removed_containers.fetch_add(removed_containers, Ordering::Relaxed);
        self.errors.fetch_add(errors, Ordering::Relaxed);
        self.last_run_epoch_ms.store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);

        if session_counts.destroyed > 0 || removed_containers > 0 {
            info!(
                removed_sessions = session_counts.destroyed,
                removed_containers,
                errors = session_counts.errors + errors,
                "reaper sweep complete"
            );
        }
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep().await,
                }
            }
        });
    }
}
