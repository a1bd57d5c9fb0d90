//! Read-side helpers for the admin surface: keyset-paginated event queries
//! against the same sqlite file the writer task owns.

use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Row, SqliteConnection};
use std::path::Path;

#[derive(Debug, Clone, serde::Serialize)]
pub struct EventRow {
    pub id: String,
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
}

#[derive(Debug, Default, Clone)]
pub struct QueryParams<'a> {
    pub tenant: Option<&'a str>,
    pub server: Option<&'a str>,
    pub method: Option<&'a str>,
    pub ok: Option<bool>,
    pub limit: usize,
}

pub async fn query_events(db_path: &Path, params: QueryParams<'_>) -> Result<Vec<EventRow>, sqlx::Error> {
    let mut conn = SqliteConnectOptions::new().filename(db_path).connect().await?;

    let mut sql = String::from(
        "SELECT id, ts_ms, tenant, session_id, method, server_name, duration_ms, ok, error, request_json, response_json FROM rpc_events",
    );
    let mut clauses = Vec::new();
    if params.tenant.is_some() {
        clauses.push("tenant = ?");
    }
    if params.server.is_some() {
        clauses.push("server_name = ?");
    }
    if params.method.is_some() {
        clauses.push("method = ?");
    }
    if params.ok.is_some() {
        clauses.push("ok = ?");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY ts_ms DESC, id DESC LIMIT ?");

    let mut query = sqlx::query(&sql);
    if let Some(t) = params.tenant {
        query = query.bind(t);
    }
    if let Some(s) = params.server {
        query = query.bind(s);
    }
    if let Some(m) = params.method {
        query = query.bind(m);
    }
    if let Some(ok) = params.ok {
        query = query.bind(ok);
    }
    let limit = if params.limit == 0 { 50 } else { params.limit.min(200) } as i64;
    query = query.bind(limit);

    let rows = query.fetch_all(&mut conn).await?;
    Ok(rows
        .into_iter()
        .map(|row| {
            let req_s: Option<String> = row.get("request_json");
            let res_s: Option<String> = row.get("response_json");
            EventRow {
                id: row.get("id"),
                ts_ms: row.get("ts_ms"),
                tenant: row.get("tenant"),
                session_id: row.get("session_id"),
                method: row.get("method"),
                server_name: row.get("server_name"),
                duration_ms: row.get("duration_ms"),
                ok: row.get("ok"),
                error: row.get("error"),
                request_json: req_s.and_then(|s| serde_json::from_str(&s).ok()),
                response_json: res_s.and_then(|s| serde_json::from_str(&s).ok()),
            }
        })
        .collect())
}

/// Convenience wrapper for the admin read route: runs `query_events` and
/// `count_events` against the same file, opening a second short-lived
/// connection for the count since `query_events` owns its own.
pub async fn query_events_with_total(
    db_path: &Path,
    params: QueryParams<'_>,
) -> Result<(Vec<EventRow>, i64), sqlx::Error> {
    let tenant = params.tenant;
    let rows = query_events(db_path, params).await?;
    let mut conn = SqliteConnectOptions::new().filename(db_path).connect().await?;
    let total = count_events(&mut conn, tenant).await?;
    Ok((rows, total))
}

pub async fn count_events(conn: &mut SqliteConnection, tenant: Option<&str>) -> Result<i64, sqlx::Error> {
    let row = if let Some(t) = tenant {
        sqlx::query("SELECT COUNT(*) AS c FROM rpc_events WHERE tenant = ?")
            .bind(t)
            .fetch_one(conn)
            .await?
    } else {
        sqlx::query("SELECT COUNT(*) AS c FROM rpc_events")
            .fetch_one(conn)
            .await?
    };
    Ok(row.get("c"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::sink::SqliteSink;

    #[tokio::test]
    async fn query_filters_by_tenant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.sqlite");
        let sink = SqliteSink::open(path.clone()).await.unwrap();
        sink.log(Event::new("alpha", "tools/list", "s1"));
        sink.log(Event::new("beta", "tools/list", "s2"));
        sink.flush().await;

        let rows = query_events(
            &path,
            QueryParams {
                tenant: Some("alpha"),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant, "alpha");
    }
}
