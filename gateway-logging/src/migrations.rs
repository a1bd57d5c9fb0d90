pub const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    tenant TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    client_name TEXT,
    client_version TEXT,
    last_seen_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS rpc_events (
    id TEXT PRIMARY KEY,
    ts_ms INTEGER NOT NULL,
    tenant TEXT NOT NULL,
    session_id TEXT NOT NULL,
    method TEXT NOT NULL,
    server_name TEXT,
    duration_ms INTEGER,
    ok INTEGER NOT NULL,
    error TEXT,
    request_json TEXT,
    response_json TEXT,
    origin TEXT
);

CREATE INDEX IF NOT EXISTS idx_rpc_events_session ON rpc_events (session_id, ts_ms);
CREATE INDEX IF NOT EXISTS idx_rpc_events_tenant ON rpc_events (tenant, ts_ms);
";
