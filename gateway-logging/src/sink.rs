//! A sqlite-backed `AuditSink`: events are handed off over a bounded
//! channel and batched onto disk by a background writer task, so logging
//! never blocks the request path that produced the event.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};

use crate::event::{AuditSink, Event};
use crate::migrations::INIT_SQL;

const FLUSH_BATCH_SIZE: usize = 256;
const FLUSH_INTERVAL: Duration = Duration::from_millis(250);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 8_192;

fn default_redact_keys() -> Vec<String> {
    vec![
        "authorization".into(),
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
        "access_token".into(),
    ]
}

enum Msg {
    Event(Box<Event>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct SqliteSink {
    tx: mpsc::Sender<Msg>,
    redact_keys: Arc<Vec<String>>,
}

impl SqliteSink {
    /// Opens (creating if missing) the sqlite file at `db_path` and spawns
    /// the writer task. Call once per process; clone the returned sink
    /// freely afterward.
    pub async fn open(db_path: PathBuf) -> Result<Self, sqlx::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                sqlx::Error::Io(std::io::Error::other(e.to_string()))
            })?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(1));
        let mut conn = options.connect().await?;
        for stmt in migration_statements() {
            sqlx::query(stmt).execute(&mut conn).await?;
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(writer_task(conn, rx));
        Ok(Self {
            tx,
            redact_keys: Arc::new(default_redact_keys()),
        })
    }

    /// Blocks until every event enqueued so far has been committed, then
    /// checkpoints the WAL. Intended for graceful shutdown.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Msg::Flush(done_tx)).await.is_ok() {
            let _ = timeout(Duration::from_secs(2), done_rx).await;
        }
    }
}

impl AuditSink for SqliteSink {
    fn log(&self, mut event: Event) {
        event.request_json = event
            .request_json
            .map(|v| redact_json(v, &self.redact_keys));
        event.response_json = event
            .response_json
            .map(|v| redact_json(v, &self.redact_keys));
        let _ = self.tx.try_send(Msg::Event(Box::new(event)));
    }
}

async fn writer_task(mut conn: SqliteConnection, mut rx: mpsc::Receiver<Msg>) {
    let mut buf: Vec<Event> = Vec::with_capacity(FLUSH_BATCH_SIZE);
    let mut last_checkpoint = Instant::now();

    loop {
        match timeout(FLUSH_INTERVAL, rx.recv()).await {
            Ok(Some(Msg::Event(evt))) => {
                buf.push(*evt);
                if buf.len() >= FLUSH_BATCH_SIZE {
                    flush(&mut conn, &mut buf).await;
                }
            }
            Ok(Some(Msg::Flush(done))) => {
                flush(&mut conn, &mut buf).await;
                let _ = checkpoint(&mut conn).await;
                last_checkpoint = Instant::now();
                let _ = done.send(());
            }
            Ok(None) => {
                flush(&mut conn, &mut buf).await;
                let _ = checkpoint(&mut conn).await;
                break;
            }
            Err(_elapsed) => {
                flush(&mut conn, &mut buf).await;
                if last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL {
                    let _ = checkpoint(&mut conn).await;
                    last_checkpoint = Instant::now();
                }
            }
        }
    }
}

async fn flush(conn: &mut SqliteConnection, buf: &mut Vec<Event>) {
    if buf.is_empty() {
        return;
    }
    if let Err(e) = flush_events(conn, buf).await {
        tracing::warn!(target = "gateway_logging", count = buf.len(), error = %e, "flush failed");
    }
    buf.clear();
}

async fn flush_events(conn: &mut SqliteConnection, events: &[Event]) -> Result<(), sqlx::Error> {
    let mut tx = conn.begin().await?;
    for event in events {
        sqlx::query(
            "INSERT INTO sessions (session_id, tenant, created_at_ms, client_name, client_version, last_seen_at_ms)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                 client_name = excluded.client_name,
                 client_version = excluded.client_version,
                 last_seen_at_ms = excluded.last_seen_at_ms",
        )
        .bind(&event.session_id)
        .bind(&event.tenant)
        .bind(event.ts_ms)
        .bind(event.client_name.as_deref())
        .bind(event.client_version.as_deref())
        .bind(event.ts_ms)
        .execute(&mut *tx)
        .await?;

        let request_json = event.request_json.as_ref().map(|v| v.to_string());
        let response_json = event.response_json.as_ref().map(|v| v.to_string());

        sqlx::query(
            "INSERT INTO rpc_events (id, ts_ms, tenant, session_id, method, server_name, duration_ms, ok, error, request_json, response_json, origin)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.ts_ms)
        .bind(&event.tenant)
        .bind(&event.session_id)
        .bind(&event.method)
        .bind(event.server_name.as_deref())
        .bind(event.duration_ms)
        .bind(event.ok)
        .bind(event.error.as_deref())
        .bind(request_json)
        .bind(response_json)
        .bind(event.origin.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

async fn checkpoint(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(conn).await?;
    Ok(())
}

fn migration_statements() -> impl Iterator<Item = &'static str> {
    INIT_SQL.split(';').map(str::trim).filter(|s| !s.is_empty())
}

/// Recursively masks values under keys in `keys_lc` (already lowercased).
pub fn redact_json(mut v: JsonValue, keys_lc: &[String]) -> JsonValue {
    fn rec(v: &mut JsonValue, keys_lc: &[String]) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if keys_lc.iter().any(|x| x == &k.to_lowercase()) {
                        *val = JsonValue::String("***".to_string());
                    } else {
                        rec(val, keys_lc);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item, keys_lc);
                }
            }
            _ => {}
        }
    }
    rec(&mut v, keys_lc);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_masks_keys_recursively() {
        let v = serde_json::json!({
            "Authorization": "Bearer x",
            "nested": { "password": "p", "keep": 1 },
            "arr": [ {"token": "a"}, {"ok": true} ]
        });
        let out = redact_json(v, &default_redact_keys());
        let s = out.to_string();
        assert!(s.contains("***"));
        assert!(!s.contains("Bearer x"));
        assert!(!s.contains("\"p\""));
        assert!(s.contains("\"keep\":1"));
    }

    #[tokio::test]
    async fn open_creates_schema_and_accepts_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteSink::open(dir.path().join("logs.sqlite")).await.unwrap();
        sink.log(Event::new("t1", "tools/call", "sess-1"));
        sink.flush().await;

        let mut conn = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(dir.path().join("logs.sqlite"))
            .connect()
            .await
            .unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rpc_events")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count.0, 1);
    }
}
