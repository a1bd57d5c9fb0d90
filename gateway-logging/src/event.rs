//! The audit event shape and the publisher trait sinks implement. Kept
//! free of any persistence backend so `gateway-core` callers can depend on
//! just the trait without pulling in `sqlx`.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub ts_ms: i64,
    pub tenant: String,
    pub session_id: String,
    pub method: String,
    pub server_name: Option<String>,
    pub duration_ms: Option<i64>,
    pub ok: bool,
    pub error: Option<String>,
    pub request_json: Option<JsonValue>,
    pub response_json: Option<JsonValue>,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    pub origin: Option<String>,
}

impl Event {
    pub fn new(tenant: impl Into<String>, method: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            tenant: tenant.into(),
            session_id: session_id.into(),
            method: method.into(),
            server_name: None,
            duration_ms: None,
            ok: true,
            error: None,
            request_json: None,
            response_json: None,
            client_name: None,
            client_version: None,
            origin: None,
        }
    }
}

/// Strictly increasing millisecond clock so `ORDER BY ts_ms` is stable even
/// when two events land in the same wall-clock millisecond.
static LAST_MS: AtomicI64 = AtomicI64::new(0);

fn now_millis() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    loop {
        let prev = LAST_MS.load(Ordering::Relaxed);
        let next = if now > prev { now } else { prev + 1 };
        if LAST_MS
            .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Abstraction over audit persistence so the router/aggregator crates
/// depend on a trait, not a concrete backend.
pub trait AuditSink: Clone + Send + Sync + 'static {
    fn log(&self, event: Event);
}

#[derive(Clone, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn log(&self, _event: Event) {}
}
