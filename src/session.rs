//! Session Manager — owns the authoritative session map, drives the per-session
//! state machine, and orchestrates silent initialization on attach.
//!
//! Sessions live in a `DashMap<Uuid, Arc<Session>>`; the exclusive section
//! around spawning a session's PTY (at most one live channel) is a CAS on
//! `Session::has_channel` rather than a lock, since the guarded section here
//! is a single atomic check rather than an async critical section.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::CircuitBreaker;
use crate::config::Configuration;
use crate::container::{ContainerManager, ContainerSpec, ContainerStatus, ResourceLimits};
use crate::error::{AppError, Result};
use crate::pty::PtyPipeline;
use crate::ratelimit::RateLimiter;
use crate::reaper::Reaper;
use crate::registry::EnvironmentRegistry;

/// Per-session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Creating,
    Ready,
    Active,
    Closing,
    Terminated,
}

/// Request body for `POST /sessions`.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub environment: Option<String>,
    pub init: Option<Vec<String>>,
    pub timeout_ms: Option<u64>,
    pub tool_pair: Option<String>,
}

/// One tenant's session: exactly one container, at most one live channel.
pub struct Session {
    pub id: Uuid,
    pub client_id: String,
    pub environment: String,
    pub container_id: String,
    pub created_at: Instant,
    pub created_at_epoch_ms: u64,
    pub timeout_ms: u64,
    pub init_commands: Vec<String>,
    init_completed: AtomicBool,
    state: Mutex<SessionState>,
    last_activity_at: Mutex<Instant>,
    ready_since: Instant,
    has_channel: AtomicBool,
    pty: Mutex<Option<Arc<PtyPipeline>>>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn touch(&self) {
        *self.last_activity_at.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity_at.lock().elapsed()
    }

    pub fn init_completed(&self) -> bool {
        self.init_completed.load(Ordering::SeqCst)
    }

    pub fn has_channel(&self) -> bool {
        self.has_channel.load(Ordering::SeqCst)
    }

    pub fn pty(&self) -> Option<Arc<PtyPipeline>> {
        self.pty.lock().clone()
    }
}

/// What `SessionManager::attach` hands back to the request surface.
pub struct AttachedSession {
    pub session: Arc<Session>,
    pub pty: Arc<PtyPipeline>,
    pub needs_init: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct SessionManagerStats {
    pub total: usize,
    pub by_state: HashMap<&'static str, usize>,
}

/// Counts produced by one reaper sweep over the session table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepCounts {
    pub destroyed: usize,
    pub errors: usize,
}

fn state_label(s: SessionState) -> &'static str {
    match s {
        SessionState::Creating => "creating",
        SessionState::Ready => "ready",
        SessionState::Active => "active",
        SessionState::Closing => "closing",
        SessionState::Terminated => "terminated",
    }
}

/// Small grace period after reaching Ready during which no channel need be
/// attached yet.
const ATTACH_GRACE: Duration = Duration::from_secs(60);

pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<Session>>,
    registry: Arc<EnvironmentRegistry>,
    containers: Arc<ContainerManager>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    config: Arc<Configuration>,
    service_prefix: String,
}

impl SessionManager {
    pub fn new(
        registry: Arc<EnvironmentRegistry>,
        containers: Arc<ContainerManager>,
        rate_limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            registry,
            containers,
            rate_limiter,
            breaker,
            service_prefix: config.service_prefix.clone(),
            config,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|r| r.value().clone())
    }

    /// Validates the environment, admits against rate limits and the
    /// circuit breaker, then creates the backing container.
    pub async fn create(&self, client_id: &str, request: CreateSessionRequest) -> Result<Arc<Session>> {
        let env_name = request.environment.as_deref().unwrap_or("bash");
        let env = self.registry.get(env_name)?;

        let timeout_ms = request
            .timeout_ms
            .unwrap_or(env.default_timeout_ms)
            .min(self.config.session_timeout_cap_ms());
        let init_commands = request.init.unwrap_or_else(|| env.default_init_commands.clone());

        let session_id = Uuid::new_v4();

        self.rate_limiter.admit_session_create(client_id, session_id)?;

        if let Err(e) = self.breaker.admit() {
            self.rate_limiter.release_session(client_id, session_id);
            return Err(e);
        }

        let created_at_epoch_ms = chrono::Utc::now().timestamp_millis() as u64;
        let mut env_vars = HashMap::new();
        env_vars.insert("TERM".to_string(), "xterm-256color".to_string());

        let spec = ContainerSpec {
            image: env.image.clone(),
            name: format!(
                "{}-{}-{}",
                self.service_prefix,
                env.name,
                &session_id.to_string()[..8]
            ),
            session_id: session_id.to_string(),
            environment: env.name.clone(),
            tool_pair: request.tool_pair.clone(),
            created_at_epoch_ms,
            env: env_vars,
            working_dir: "/home/sandbox".to_string(),
            uid_gid: "1000:1000".to_string(),
            limits: ResourceLimits::default(),
            service_prefix: self.service_prefix.clone(),
        };

        let container_id = match self.containers.create(spec).await {
            Ok(id) => id,
            Err(e) => {
                self.rate_limiter.release_session(client_id, session_id);
                self.breaker.report_admission(false);
                return Err(AppError::ContainerFailed(e.to_string()));
            }
        };

        self.breaker.report_admission(true);

        let session = Arc::new(Session {
            id: session_id,
            client_id: client_id.to_string(),
            environment: env.name.clone(),
            container_id,
            created_at: Instant::now(),
            created_at_epoch_ms,
            timeout_ms,
            init_commands,
            init_completed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Creating),
            last_activity_at: Mutex::new(Instant::now()),
            ready_since: Instant::now(),
            has_channel: AtomicBool::new(false),
            pty: Mutex::new(None),
        });

        *session.state.lock() = SessionState::Ready;
        self.sessions.insert(session_id, session.clone());
        info!(session = %session_id, environment = %env.name, client = client_id, "session ready");
        Ok(session)
    }

    /// Attach a channel to a Ready/Active session. Spawns the PTY lazily on
    /// first attach; a reattach within the idle budget reuses the existing
    /// pipeline (the "preserve" resolution of the reconnection question —
    /// see DESIGN.md).
    pub async fn attach(&self, session_id: Uuid) -> Result<AttachedSession> {
        let session = self
            .sessions
            .get(&session_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;

        match session.state() {
            SessionState::Ready | SessionState::Active => {}
            SessionState::Creating => {
                return Err(AppError::InvalidRequest("session still creating".into()))
            }
            SessionState::Closing | SessionState::Terminated => {
                return Err(AppError::NotFound(format!("session {session_id}")));
            }
        }

        if session
            .has_channel
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::AlreadyAttached);
        }

        let pty = {
            let mut guard = session.pty.lock();
            if let Some(existing) = guard.as_ref().filter(|p| !p.has_exited()) {
                existing.clone()
            } else {
                let spawned = match PtyPipeline::spawn(
                    self.containers.clone(),
                    session.container_id.clone(),
                    "1000:1000".to_string(),
                    80,
                    24,
                )
                .await
                {
                    Ok(p) => Arc::new(p),
                    Err(e) => {
                        session.has_channel.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                };
                *guard = Some(spawned.clone());
                spawned
            }
        };

        let needs_init = !session.init_commands.is_empty() && !session.init_completed();
        Ok(AttachedSession { session, pty, needs_init })
    }

    /// Writes each init command to the PTY behind the silent gate and waits
    /// for output to quiesce (or the bounded timeout) before clearing it.
    ///
    /// Quiescence is read off `PtyPipeline::activity_tick`, not
    /// `subscribe_output` — the output sink only carries bytes that already
    /// passed the gate, so a subscription taken after `set_silent(true)`
    /// would never observe anything and this would always fall through to
    /// the first poll. The activity tick is bumped by the PTY's outbound
    /// task ahead of its own gate check, so it advances for gated output too.
    pub async fn run_init(&self, session: &Session, pty: &PtyPipeline) -> std::result::Result<(), String> {
        if session.init_commands.is_empty() {
            session.init_completed.store(true, Ordering::SeqCst);
            return Ok(());
        }

        pty.set_silent(true);
        for cmd in &session.init_commands {
            let mut line = cmd.clone().into_bytes();
            line.push(b'\n');
            if let Err(e) = pty.write_input(line) {
                pty.set_silent(false);
                return Err(e.to_string());
            }
        }

        let timeout = Duration::from_millis(self.config.init_timeout_ms());
        let deadline = Instant::now() + timeout;
        let quiet_for = Duration::from_millis(300);
        let poll_interval = Duration::from_millis(50);

        let mut last_tick = pty.activity_tick();
        let mut last_change = Instant::now();
        loop {
            let now = Instant::now();
            if now >= deadline || last_change.elapsed() >= quiet_for {
                break;
            }
            tokio::time::sleep(poll_interval.min(deadline.saturating_duration_since(now))).await;

            let tick = pty.activity_tick();
            if tick != last_tick {
                last_tick = tick;
                last_change = Instant::now();
            }
        }

        pty.set_silent(false);
        session.init_completed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Called on every inbound client message and every outbound PTY chunk.
    pub fn touch(&self, session_id: Uuid) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.touch();
            let mut state = session.state.lock();
            if *state == SessionState::Ready {
                *state = SessionState::Active;
            }
        }
    }

    /// Mark a session's channel as detached without destroying the session
    /// (preserve-on-disconnect policy). The session still idles out normally.
    pub fn mark_channel_closed(&self, session_id: Uuid) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.has_channel.store(false, Ordering::SeqCst);
        }
    }

    /// Idempotent: closes the channel/PTY, stops+removes the container, frees
    /// rate-limiter slots, and marks Terminated. Safe to call more than once.
    pub async fn destroy(&self, session_id: Uuid, reason: &str) -> Result<()> {
        let session = match self.sessions.get(&session_id) {
            Some(r) => r.value().clone(),
            None => return Ok(()),
        };

        {
            let mut state = session.state.lock();
            if *state == SessionState::Terminated {
                return Ok(());
            }
            *state = SessionState::Terminated;
        }

        if let Some(pty) = session.pty.lock().take() {
            pty.shutdown();
        }
        session.has_channel.store(false, Ordering::SeqCst);

        if let Err(e) = self.containers.stop(&session.container_id, Duration::from_secs(5)).await {
            warn!(session = %session_id, error = %e, "stop failed during destroy, attempting remove anyway");
        }
        if let Err(e) = self.containers.remove(&session.container_id, true).await {
            warn!(session = %session_id, error = %e, "container remove failed during destroy");
        }

        self.rate_limiter.release_session(&session.client_id, session_id);
        self.sessions.remove(&session_id);
        info!(session = %session_id, reason, "session destroyed");
        Ok(())
    }

    /// All live session ids, for the shutdown sequence: shutdown reverses
    /// startup by closing channels and destroying sessions before the
    /// daemon connection is closed.
    pub fn all_ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|r| *r.key()).collect()
    }

    pub fn stats(&self) -> SessionManagerStats {
        let mut by_state = HashMap::new();
        for entry in self.sessions.iter() {
            *by_state.entry(state_label(entry.value().state())).or_insert(0) += 1;
        }
        SessionManagerStats { total: self.sessions.len(), by_state }
    }

    /// Enumerates sessions and destroys any that have violated their idle
    /// budget, never attached within the grace window, or whose container
    /// has stopped running. Invoked by the Reaper's per-sweep step 1.
    pub async fn sweep(&self) -> SweepCounts {
        let mut counts = SweepCounts::default();
        let candidates: Vec<Arc<Session>> = self.sessions.iter().map(|r| r.value().clone()).collect();

        for session in candidates {
            let should_destroy = match session.state() {
                SessionState::Closing => true,
                SessionState::Ready if session.ready_since.elapsed() > ATTACH_GRACE && !session.has_channel() => true,
                SessionState::Ready | SessionState::Active => {
                    if session.idle_for() > Duration::from_millis(session.timeout_ms) {
                        true
                    } else {
                        match self.containers.inspect(&session.container_id).await {
                            Ok(info) => info.status != ContainerStatus::Running,
                            Err(_) => true,
                        }
                    }
                }
                SessionState::Creating | SessionState::Terminated => false,
            };

            if should_destroy {
                if let Err(e) = self.destroy(session.id, "reaper sweep").await {
                    warn!(session = %session.id, error = %e, "reaper failed to destroy session");
                    counts.errors += 1;
                } else {
                    counts.destroyed += 1;
                }
            }
        }

        counts
    }

    /// Spawns the Reaper and returns a handle plus a join handle for the
    /// background task.
    pub fn start_cleanup_scheduler(
        self: &Arc<Self>,
        containers: Arc<ContainerManager>,
        interval: Duration,
        max_container_age: Duration,
        cancel: CancellationToken,
    ) -> Arc<Reaper> {
        let reaper = Arc::new(Reaper::new(
            self.clone(),
            containers,
            self.service_prefix.clone(),
            max_container_age,
        ));
        reaper.clone().spawn(interval, cancel);
        debug!("cleanup scheduler started");
        reaper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_labels_cover_all_variants() {
        assert_eq!(state_label(SessionState::Creating), "creating");
        assert_eq!(state_label(SessionState::Terminated), "terminated");
    }

    fn bare_session(init_completed: bool) -> Session {
        Session {
            id: Uuid::new_v4(),
            client_id: "test-client".to_string(),
            environment: "bash".to_string(),
            container_id: "deadbeef".to_string(),
            created_at: Instant::now(),
            created_at_epoch_ms: 0,
            timeout_ms: 60_000,
            init_commands: vec!["echo hi".to_string()],
            init_completed: AtomicBool::new(init_completed),
            state: Mutex::new(SessionState::Ready),
            last_activity_at: Mutex::new(Instant::now()),
            ready_since: Instant::now(),
            has_channel: AtomicBool::new(true),
            pty: Mutex::new(None),
        }
    }

    /// The "preserve" reconnection policy (DESIGN.md): a channel that closes
    /// after init has already run must not re-trigger init on the next
    /// attach. `SessionManager::attach` itself needs a live container to
    /// spawn a PTY against, so this exercises the state transitions it
    /// relies on directly: `mark_channel_closed` releases the exclusivity
    /// slot without touching `init_completed`, and a subsequent attach's
    /// `needs_init` computation (`!init_commands.is_empty() &&
    /// !init_completed()`) comes out false.
    #[test]
    fn reattach_within_grace_resumes_without_reinit() {
        let session = bare_session(true);
        assert!(session.has_channel());

        session.has_channel.store(false, Ordering::SeqCst);
        assert!(!session.has_channel());
        assert!(session.init_completed());

        let reattached = session
            .has_channel
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        assert!(reattached);

        let needs_init = !session.init_commands.is_empty() && !session.init_completed();
        assert!(!needs_init, "a reattach after init should not re-run init commands");
    }

    #[test]
    fn fresh_session_without_completed_init_still_needs_it() {
        let session = bare_session(false);
        let needs_init = !session.init_commands.is_empty() && !session.init_completed();
        assert!(needs_init);
    }
}
