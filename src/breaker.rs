//! Circuit Breaker — global admission gate driven by fleet load metrics.
//!
//! The metrics sampler is a `tokio::spawn`ed loop ticking on
//! `tokio::time::interval`, cancelled via a `tokio_util::sync::
//! CancellationToken`; the memory threshold comes from the same
//! `sysinfo`-based host inspection the diagnostics command prints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::container::ContainerManager;
use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CircuitMetrics {
    pub containers: u64,
    pub max_containers: u64,
    pub memory_percent: f32,
    pub max_memory_percent: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: BreakerState,
    pub reason: Option<String>,
    pub metrics: CircuitMetrics,
}

struct Inner {
    state: BreakerState,
    opened_at: Option<Instant>,
    reason: Option<String>,
    metrics: CircuitMetrics,
    trial_in_flight: bool,
}

/// Single global instance; shared behind an `Arc` by the Session Manager,
/// the status endpoint, and its own sampling task.
pub struct CircuitBreaker {
    inner: RwLock<Inner>,
    max_containers: u64,
    max_memory_percent: f32,
    cooldown: Duration,
    containers: Arc<ContainerManager>,
    service_prefix: String,
}

impl CircuitBreaker {
    pub fn new(
        containers: Arc<ContainerManager>,
        service_prefix: String,
        max_containers: u64,
        max_memory_percent: f32,
        cooldown: Duration,
    ) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: BreakerState::Closed,
                opened_at: None,
                reason: None,
                metrics: CircuitMetrics {
                    containers: 0,
                    max_containers,
                    memory_percent: 0.0,
                    max_memory_percent,
                },
                trial_in_flight: false,
            }),
            max_containers,
            max_memory_percent,
            cooldown,
            containers,
            service_prefix,
        }
    }

    /// Existing sessions are unaffected; only new admissions check this.
    pub fn admit(&self) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
                if opened_at.elapsed() >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!("circuit breaker: Open -> HalfOpen, admitting trial request");
                    Ok(())
                } else {
                    Err(AppError::ServiceUnavailable {
                        reason: inner.reason.clone().unwrap_or_else(|| "circuit open".into()),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(AppError::ServiceUnavailable {
                        reason: "circuit half-open, trial in flight".into(),
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Resolves a HalfOpen trial admitted by `admit()`. No-op if the breaker
    /// was Closed when the caller's operation ran (common case).
    pub fn report_admission(&self, success: bool) {
        let mut inner = self.inner.write();
        if inner.state != BreakerState::HalfOpen {
            return;
        }
        inner.trial_in_flight = false;
        let metrics_ok = inner.metrics.containers <= inner.metrics.max_containers
            && inner.metrics.memory_percent <= inner.metrics.max_memory_percent;
        if success && metrics_ok {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.reason = None;
            info!("circuit breaker: HalfOpen -> Closed");
        } else {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.reason = Some(if success {
                "metrics still over threshold".to_string()
            } else {
                "trial session creation failed".to_string()
            });
            warn!("circuit breaker: HalfOpen -> Open ({:?})", inner.reason);
        }
    }

    pub fn status(&self) -> CircuitSnapshot {
        let inner = self.inner.read();
        CircuitSnapshot { state: inner.state, reason: inner.reason.clone(), metrics: inner.metrics }
    }

    /// One sampling pass: refresh running-container count and host memory
    /// percent, and trip Closed -> Open if either threshold is exceeded.
    async fn sample(&self, sys: &mut System) {
        let containers = self
            .containers
            .list(&self.service_prefix, Default::default())
            .await
            .map(|v| v.len() as u64)
            .unwrap_or(0);

        sys.refresh_memory();
        let total = sys.total_memory().max(1);
        let used = sys.used_memory();
        let memory_percent = (used as f64 / total as f64 * 100.0) as f32;

        let mut inner = self.inner.write();
        inner.metrics = CircuitMetrics {
            containers,
            max_containers: self.max_containers,
            memory_percent,
            max_memory_percent: self.max_memory_percent,
        };

        if inner.state == BreakerState::Closed {
            let over_containers = containers > self.max_containers;
            let over_memory = memory_percent > self.max_memory_percent;
            if over_containers || over_memory {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.reason = Some(if over_containers {
                    format!("container count {containers} exceeds max {}", self.max_containers)
                } else {
                    format!("memory {memory_percent:.1}% exceeds max {:.1}%", self.max_memory_percent)
                });
                warn!(reason = ?inner.reason, "circuit breaker: Closed -> Open");
            }
        }
    }

    /// Spawns the periodic metrics sampler (15s default tick).
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sample(&mut sys).await,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerManager;

    fn breaker() -> CircuitBreaker {
        let containers = Arc::new(ContainerManager::connect("/var/run/docker.sock").unwrap());
        CircuitBreaker::new(containers, "sandbox".into(), 100, 90.0, Duration::from_millis(10))
    }

    #[test]
    fn closed_admits_freely() {
        let b = breaker();
        assert!(b.admit().is_ok());
        assert_eq!(b.status().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_rejects_concurrent_trials() {
        let b = breaker();
        {
            let mut inner = b.inner.write();
            inner.state = BreakerState::HalfOpen;
        }
        assert!(b.admit().is_ok());
        assert!(b.admit().is_err());
    }

    #[test]
    fn half_open_success_closes_when_metrics_ok() {
        let b = breaker();
        {
            let mut inner = b.inner.write();
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = true;
        }
        b.report_admission(true);
        assert_eq!(b.status().state, BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker();
        {
            let mut inner = b.inner.write();
            inner.state = BreakerState::HalfOpen;
            inner.trial_in_flight = true;
        }
        b.report_admission(false);
        assert_eq!(b.status().state, BreakerState::Open);
    }
}
