//! Audit/RPC event logging: every JSON-RPC call the gateway handles is
//! recorded to sqlite for later inspection, independent of `tracing`'s
//! structured operational logs.

pub mod event;
pub mod migrations;
pub mod origin;
pub mod query;
pub mod sink;

pub use event::{AuditSink, Event, NullSink};
pub use origin::{current_request_origin, with_request_origin};
pub use sink::SqliteSink;
