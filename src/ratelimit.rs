//! Rate Limiter — four-dimensional per-client admission control.
//!
//! A `dashmap`-keyed per-client tracking table, with each entry guarded by a
//! `parking_lot::Mutex` around its small synchronous window state. Per-key
//! locking keeps two concurrent requests from the same client observing
//! consistent counters while distinct clients proceed in parallel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Configuration;
use crate::error::{AppError, Result};

const HOUR: Duration = Duration::from_secs(3600);
const MINUTE: Duration = Duration::from_secs(60);

struct ClientEntry {
    session_count: u32,
    hour_window_start: Instant,
    command_count: u32,
    minute_window_start: Instant,
    active_sessions: HashSet<Uuid>,
    active_channels: HashSet<Uuid>,
    max_sessions_override: Option<u32>,
    max_commands_override: Option<u32>,
}

impl ClientEntry {
    fn new(now: Instant) -> Self {
        Self {
            session_count: 0,
            hour_window_start: now,
            command_count: 0,
            minute_window_start: now,
            active_sessions: HashSet::new(),
            active_channels: HashSet::new(),
            max_sessions_override: None,
            max_commands_override: None,
        }
    }

    /// Windows slide forward only; stale windows reset on read.
    fn roll_windows(&mut self, now: Instant) {
        if now.duration_since(self.hour_window_start) >= HOUR {
            self.hour_window_start = now;
            self.session_count = 0;
        }
        if now.duration_since(self.minute_window_start) >= MINUTE {
            self.minute_window_start = now;
            self.command_count = 0;
        }
    }
}

/// Read-only admin projection of a client's tracking state.
#[derive(Debug, Serialize)]
pub struct ClientTrackingView {
    pub client_id: String,
    pub session_count: u32,
    pub command_count: u32,
    pub active_sessions: usize,
    pub active_channels: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AdjustParams {
    pub window_duration_ms: Option<u64>,
    pub max_requests: Option<u32>,
}

pub struct RateLimiter {
    clients: DashMap<String, Mutex<ClientEntry>>,
    max_concurrent_sessions: u32,
    sessions_per_hour: u32,
    commands_per_minute: u32,
    max_concurrent_channels: u32,
    development_mode: bool,
}

impl RateLimiter {
    pub fn new(config: &Configuration) -> Self {
        Self {
            clients: DashMap::new(),
            max_concurrent_sessions: config.max_concurrent_sessions,
            sessions_per_hour: config.sessions_per_hour,
            commands_per_minute: config.commands_per_minute,
            max_concurrent_channels: config.max_concurrent_channels,
            development_mode: config.development_mode,
        }
    }

    fn entry(&self, client_id: &str) -> dashmap::mapref::one::Ref<'_, String, Mutex<ClientEntry>> {
        if !self.clients.contains_key(client_id) {
            self.clients
                .entry(client_id.to_string())
                .or_insert_with(|| Mutex::new(ClientEntry::new(Instant::now())));
        }
        self.clients.get(client_id).expect("just inserted")
    }

    /// Atomically checks and reserves a concurrency slot plus the hourly
    /// counter for `client_id` using the caller-supplied `session_id`
    /// (generated by the Session Manager before any container is created, so
    /// the reservation and the eventual `release_session` always agree on id).
    pub fn admit_session_create(&self, client_id: &str, session_id: Uuid) -> Result<()> {
        let entry_ref = self.entry(client_id);
        let mut entry = entry_ref.lock();
        let now = Instant::now();
        entry.roll_windows(now);

        let max_sessions = entry.max_sessions_override.unwrap_or(self.max_concurrent_sessions);
        if !self.development_mode && entry.active_sessions.len() as u32 >= max_sessions {
            return Err(AppError::TooManyRequests {
                reason: format!("concurrent session limit ({max_sessions}) reached"),
                retry_after_secs: 5,
            });
        }
        let hourly_cap = self.sessions_per_hour;
        if !self.development_mode && entry.session_count >= hourly_cap {
            let retry_after = HOUR
                .saturating_sub(now.duration_since(entry.hour_window_start))
                .as_secs()
                .max(1);
            return Err(AppError::TooManyRequests {
                reason: format!("hourly session limit ({hourly_cap}) reached"),
                retry_after_secs: retry_after,
            });
        }

        entry.session_count += 1;
        entry.active_sessions.insert(session_id);
        Ok(())
    }

    /// Idempotent removal on every terminal transition.
    pub fn release_session(&self, client_id: &str, session_id: Uuid) {
        if let Some(entry_ref) = self.clients.get(client_id) {
            entry_ref.lock().active_sessions.remove(&session_id);
        }
    }

    pub fn admit_command(&self, client_id: &str) -> Result<()> {
        let entry_ref = self.entry(client_id);
        let mut entry = entry_ref.lock();
        let now = Instant::now();
        entry.roll_windows(now);

        let cap = entry.max_commands_override.unwrap_or(self.commands_per_minute);
        if !self.development_mode && entry.command_count >= cap {
            let retry_after = MINUTE
                .saturating_sub(now.duration_since(entry.minute_window_start))
                .as_secs()
                .max(1);
            return Err(AppError::TooManyRequests {
                reason: format!("command rate limit ({cap}/min) reached"),
                retry_after_secs: retry_after,
            });
        }
        entry.command_count += 1;
        Ok(())
    }

    pub fn admit_channel(&self, client_id: &str, channel_id: Uuid) -> Result<()> {
        let entry_ref = self.entry(client_id);
        let mut entry = entry_ref.lock();
        if !self.development_mode && entry.active_channels.len() as u32 >= self.max_concurrent_channels {
            return Err(AppError::TooManyRequests {
                reason: format!("concurrent channel limit ({}) reached", self.max_concurrent_channels),
                retry_after_secs: 5,
            });
        }
        entry.active_channels.insert(channel_id);
        Ok(())
    }

    pub fn release_channel(&self, client_id: &str, channel_id: Uuid) {
        if let Some(entry_ref) = self.clients.get(client_id) {
            entry_ref.lock().active_channels.remove(&channel_id);
        }
    }

    pub fn status(&self, client_id: &str) -> Option<ClientTrackingView> {
        let entry_ref = self.clients.get(client_id)?;
        let entry = entry_ref.lock();
        Some(ClientTrackingView {
            client_id: client_id.to_string(),
            session_count: entry.session_count,
            command_count: entry.command_count,
            active_sessions: entry.active_sessions.len(),
            active_channels: entry.active_channels.len(),
        })
    }

    pub fn list_status(&self) -> Vec<ClientTrackingView> {
        self.clients
            .iter()
            .map(|r| {
                let entry = r.value().lock();
                ClientTrackingView {
                    client_id: r.key().clone(),
                    session_count: entry.session_count,
                    command_count: entry.command_count,
                    active_sessions: entry.active_sessions.len(),
                    active_channels: entry.active_channels.len(),
                }
            })
            .collect()
    }

    /// Admin `reset`: drops all tracking for the client outright.
    pub fn reset(&self, client_id: &str) -> bool {
        self.clients.remove(client_id).is_some()
    }

    /// Admin `adjust`: resets counters to zero and, if supplied, installs
    /// per-client overrides for the hourly session cap / per-minute command
    /// cap (the two caps `adjust`'s request body can name).
    pub fn adjust(&self, client_id: &str, params: AdjustParams) -> Option<ClientTrackingView> {
        let entry_ref = self.clients.get(client_id)?;
        let mut entry = entry_ref.lock();
        let now = Instant::now();
        entry.session_count = 0;
        entry.command_count = 0;
        entry.hour_window_start = now;
        entry.minute_window_start = now;
        if let Some(max_requests) = params.max_requests {
            entry.max_commands_override = Some(max_requests);
        }
        if params.window_duration_ms.is_some() {
            // Window *duration* overrides aren't modeled per-client — only the
            // counters reset; see DESIGN.md rather than adding a second timer
            // base per client.
        }
        drop(entry);
        self.status(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Configuration {
        use clap::Parser;
        Configuration::parse_from(["test"])
    }

    #[test]
    fn concurrent_session_limit_enforced() {
        let limiter = RateLimiter::new(&test_config());
        let client = "1.2.3.4";
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        limiter.admit_session_create(client, a).unwrap();
        limiter.admit_session_create(client, b).unwrap();
        assert!(limiter.admit_session_create(client, c).is_err());

        limiter.release_session(client, a);
        limiter.admit_session_create(client, c).unwrap();
    }

    #[test]
    fn reset_then_admit_succeeds() {
        let limiter = RateLimiter::new(&test_config());
        let client = "5.6.7.8";
        for _ in 0..2 {
            limiter.admit_session_create(client, Uuid::new_v4()).unwrap();
        }
        assert!(limiter.admit_session_create(client, Uuid::new_v4()).is_err());
        assert!(limiter.reset(client));
        limiter.admit_session_create(client, Uuid::new_v4()).unwrap();
    }

    #[test]
    fn development_mode_bypasses_admission_but_still_counts() {
        use clap::Parser;
        let mut config = Configuration::parse_from(["test"]);
        config.development_mode = true;
        config.max_concurrent_sessions = 1;
        let limiter = RateLimiter::new(&config);
        let client = "dev";
        limiter.admit_session_create(client, Uuid::new_v4()).unwrap();
        limiter.admit_session_create(client, Uuid::new_v4()).unwrap();
        let status = limiter.status(client).unwrap();
        assert_eq!(status.active_sessions, 2);
    }
}
