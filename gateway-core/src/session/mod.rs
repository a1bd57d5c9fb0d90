//! Session Manager (spec §4.3): one entity per active client attachment,
//! owning the event queue and the `fresh → initialized → terminated` state
//! machine. Sessions are referenced by upstream bindings through a handle
//! (id + generation) rather than a back-pointer, per Design Notes §9 — when
//! the upstream supervisor restarts a connector the generation bumps and a
//! session discovers the stale binding on its next call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{GatewayError, GatewayResult};

pub const DEFAULT_QUEUE_CAP: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransport {
    Sse,
    StreamableHttp,
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Initialized,
    Terminated,
}

/// A reference to an upstream connection that survives upstream restarts:
/// the supervisor bumps `generation` on every respawn, so a session holding
/// a stale `(id, generation)` pair knows to re-resolve rather than use a
/// dead connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamHandle {
    pub id: u64,
    pub generation: u32,
}

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub id: u64,
    pub event_type: String,
    pub payload: Value,
}

pub type SessionId = String;

fn new_session_id() -> SessionId {
    // UUIDv4 carries 122 bits of randomness, comfortably over the ≥128-bit
    // entropy floor once rendered as an opaque string (the non-random
    // version/variant bits don't reduce guessing resistance in practice).
    Uuid::new_v4().to_string()
}

pub struct Session {
    pub id: SessionId,
    pub prefix: String,
    pub transport: SessionTransport,
    state: parking_lot::RwLock<SessionState>,
    queue: parking_lot::Mutex<VecDeque<QueuedEvent>>,
    queue_cap: usize,
    last_event_id: AtomicU64,
    last_activity_secs: AtomicI64,
    upstream: parking_lot::RwLock<Option<UpstreamHandle>>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn last_event_id(&self) -> u64 {
        self.last_event_id.load(Ordering::SeqCst)
    }

    pub fn upstream_handle(&self) -> Option<UpstreamHandle> {
        *self.upstream.read()
    }

    pub fn bind_upstream(&self, handle: UpstreamHandle) {
        *self.upstream.write() = Some(handle);
    }
}

pub enum InitializeOutcome {
    Initialized,
    /// Client sent `initialize` again after already initializing — a
    /// protocol error, but the session itself stays `initialized`.
    AlreadyInitialized,
}

pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    queue_cap: usize,
    idle_timeout_secs: i64,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: DashMap::new(),
            queue_cap: DEFAULT_QUEUE_CAP,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            clock,
        }
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap;
        self
    }

    pub fn with_idle_timeout_secs(mut self, secs: i64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    pub fn create(&self, prefix: impl Into<String>, transport: SessionTransport) -> Arc<Session> {
        let session = Arc::new(Session {
            id: new_session_id(),
            prefix: prefix.into(),
            transport,
            state: parking_lot::RwLock::new(SessionState::Fresh),
            queue: parking_lot::Mutex::new(VecDeque::new()),
            queue_cap: self.queue_cap,
            last_event_id: AtomicU64::new(0),
            last_activity_secs: AtomicI64::new(self.clock.now_unix_secs()),
            upstream: parking_lot::RwLock::new(None),
        });
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|e| e.clone())
    }

    pub fn touch(&self, id: &str) {
        if let Some(s) = self.get(id) {
            s.last_activity_secs
                .store(self.clock.now_unix_secs(), Ordering::SeqCst);
        }
    }

    /// `fresh → initialized`. Returns `AlreadyInitialized` (not an error —
    /// the session stays alive) when the client sends `initialize` twice.
    pub fn initialize(&self, id: &str) -> GatewayResult<InitializeOutcome> {
        let session = self
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {id}")))?;
        let mut state = session.state.write();
        match *state {
            SessionState::Fresh => {
                *state = SessionState::Initialized;
                Ok(InitializeOutcome::Initialized)
            }
            SessionState::Initialized => Ok(InitializeOutcome::AlreadyInitialized),
            SessionState::Terminated => {
                Err(GatewayError::NotFound(format!("session {id} terminated")))
            }
        }
    }

    /// Enqueues an event for delivery. The `(N+1)`th enqueue against a
    /// queue already holding the configured capacity terminates the
    /// session rather than evicting — unbounded retention would grow
    /// memory for a stalled consumer; overflow means the client must
    /// reconnect and re-initialize.
    pub fn enqueue(&self, id: &str, event_type: impl Into<String>, payload: Value) -> GatewayResult<u64> {
        let session = self
            .get(id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {id}")))?;
        let mut queue = session.queue.lock();
        if queue.len() >= session.queue_cap {
            drop(queue);
            self.terminate(id);
            return Err(GatewayError::Internal(format!(
                "session {id} event queue overflow; session terminated"
            )));
        }
        let next_id = session.last_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        queue.push_back(QueuedEvent {
            id: next_id,
            event_type: event_type.into(),
            payload,
        });
        Ok(next_id)
    }

    /// Replays events with id > `last_event_id` for SSE/streamable-HTTP
    /// resumption. A missing session (already terminated, e.g. by queue
    /// overflow or idle timeout) surfaces as a "must reinitialize" error —
    /// there is nothing left to replay from.
    pub fn replay_from(&self, id: &str, last_event_id: u64) -> GatewayResult<Vec<QueuedEvent>> {
        let session = self.get(id).ok_or_else(|| {
            GatewayError::NotFound(format!("session {id} gone; client must reinitialize"))
        })?;
        let queue = session.queue.lock();
        Ok(queue
            .iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect())
    }

    pub fn terminate(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            *session.state.write() = SessionState::Terminated;
            session.queue.lock().clear();
        }
    }

    /// Sweeps sessions idle longer than the configured timeout. Intended to
    /// be called periodically from a background task.
    pub fn reap_idle(&self) -> Vec<SessionId> {
        let now = self.clock.now_unix_secs();
        let mut reaped = Vec::new();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                now - entry.value().last_activity_secs.load(Ordering::SeqCst)
                    > self.idle_timeout_secs
            })
            .map(|entry| entry.key().clone())
            .collect();
        for id in stale {
            self.terminate(&id);
            reaped.push(id);
        }
        reaped
    }

    pub async fn run_idle_reaper(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = self.reap_idle();
            if !reaped.is_empty() {
                tracing::info!(target = "session_manager", count = reaped.len(), "reaped idle sessions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use serde_json::json;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(FakeClock::new(0)))
    }

    #[test]
    fn initialize_transitions_fresh_to_initialized() {
        let mgr = manager();
        let s = mgr.create("/p", SessionTransport::Sse);
        assert_eq!(s.state(), SessionState::Fresh);
        mgr.initialize(&s.id).unwrap();
        assert_eq!(s.state(), SessionState::Initialized);
    }

    #[test]
    fn double_initialize_is_reported_but_not_fatal() {
        let mgr = manager();
        let s = mgr.create("/p", SessionTransport::Sse);
        mgr.initialize(&s.id).unwrap();
        let outcome = mgr.initialize(&s.id).unwrap();
        assert!(matches!(outcome, InitializeOutcome::AlreadyInitialized));
        assert_eq!(s.state(), SessionState::Initialized);
    }

    #[test]
    fn last_event_id_is_strictly_monotonic() {
        let mgr = manager();
        let s = mgr.create("/p", SessionTransport::Sse);
        let mut prev = 0;
        for _ in 0..10 {
            let id = mgr.enqueue(&s.id, "message", json!({})).unwrap();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn overflow_terminates_session() {
        let mgr = SessionManager::new(Arc::new(FakeClock::new(0))).with_queue_cap(4);
        let s = mgr.create("/p", SessionTransport::Sse);
        for _ in 0..4 {
            mgr.enqueue(&s.id, "message", json!({})).unwrap();
        }
        assert!(mgr.enqueue(&s.id, "message", json!({})).is_err());
        assert!(mgr.get(&s.id).is_none());
    }

    #[test]
    fn resume_replays_exactly_tail_events() {
        let mgr = manager();
        let s = mgr.create("/p", SessionTransport::Sse);
        for _ in 0..4 {
            mgr.enqueue(&s.id, "message", json!({})).unwrap();
        }
        let replayed = mgr.replay_from(&s.id, 2).unwrap();
        let ids: Vec<u64> = replayed.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3, 4]);
    }

    #[test]
    fn resume_against_gone_session_requires_reinitialize() {
        let mgr = manager();
        assert!(mgr.replay_from("nonexistent", 0).is_err());
    }

    #[test]
    fn idle_reaper_terminates_stale_sessions() {
        let clock = Arc::new(FakeClock::new(0));
        let mgr = SessionManager::new(clock.clone()).with_idle_timeout_secs(60);
        let s = mgr.create("/p", SessionTransport::Sse);
        clock.advance(61);
        let reaped = mgr.reap_idle();
        assert_eq!(reaped, vec![s.id.clone()]);
        assert!(mgr.get(&s.id).is_none());
    }

    #[test]
    fn upstream_handle_rebinds_after_generation_bump() {
        let mgr = manager();
        let s = mgr.create("/p", SessionTransport::Sse);
        s.bind_upstream(UpstreamHandle { id: 1, generation: 0 });
        assert_eq!(s.upstream_handle(), Some(UpstreamHandle { id: 1, generation: 0 }));
        s.bind_upstream(UpstreamHandle { id: 1, generation: 1 });
        assert_eq!(s.upstream_handle(), Some(UpstreamHandle { id: 1, generation: 1 }));
    }
}
