//! Admin surface (spec §4.1): reload/rollback/version listing plus a
//! liveness probe, gated by a `JwtVerifier` the way the core documents it —
//! the gateway never issues these tokens itself, only verifies them.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use gateway_core::config::plane::ConfigPlane;
use gateway_core::jwt::JwtVerifier;
use gateway_core::oauth::constant_time_eq;
use gateway_logging::query::{QueryParams, query_events_with_total};

pub struct AdminState {
    pub plane: Arc<ConfigPlane>,
    pub verifier: Arc<dyn JwtVerifier>,
    pub log_db: PathBuf,
}

/// Accepts exactly one shared token, compared in constant time since it
/// guards the same class of secret a bearer token would.
pub struct SharedSecretVerifier(pub String);

impl JwtVerifier for SharedSecretVerifier {
    fn verify(&self, token: &str) -> Result<String, String> {
        if constant_time_eq(token.as_bytes(), self.0.as_bytes()) {
            Ok("admin".to_string())
        } else {
            Err("invalid admin token".to_string())
        }
    }
}

pub fn admin_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/admin/reload", post(reload))
        .route("/admin/versions", get(versions))
        .route("/admin/rollback/{id}", post(rollback))
        .route("/admin/audit", get(audit))
        .with_state(state)
}

fn authorize(state: &AdminState, headers: &HeaderMap) -> Result<String, Response> {
    let token = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing bearer token").into_response())?;
    state
        .verifier
        .verify(token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e).into_response())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn reload(State(state): State<Arc<AdminState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.plane.reload_now().await {
        Ok(snap) => Json(serde_json::json!({ "id": snap.id, "hash": snap.hash })).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn versions(State(state): State<Arc<AdminState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let versions: Vec<_> = state
        .plane
        .list_versions()
        .into_iter()
        .map(|(id, hash, installed_at)| {
            serde_json::json!({ "id": id, "hash": hash, "installedAt": installed_at })
        })
        .collect();
    Json(versions).into_response()
}

async fn rollback(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    match state.plane.rollback_to(id) {
        Some(snap) => Json(serde_json::json!({ "id": snap.id, "hash": snap.hash })).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown snapshot id").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    tenant: Option<String>,
    server: Option<String>,
    method: Option<String>,
    ok: Option<bool>,
    #[serde(default)]
    limit: usize,
}

async fn audit(
    State(state): State<Arc<AdminState>>,
    headers: HeaderMap,
    Query(q): Query<AuditQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }
    let params = QueryParams {
        tenant: q.tenant.as_deref(),
        server: q.server.as_deref(),
        method: q.method.as_deref(),
        ok: q.ok,
        limit: q.limit,
    };
    match query_events_with_total(&state.log_db, params).await {
        Ok((rows, total)) => Json(serde_json::json!({ "total": total, "events": rows })).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gateway_core::clock::test_support::FakeClock;
    use gateway_core::config::source::StaticConfigSource;
    use tower::ServiceExt;

    #[test]
    fn shared_secret_verifier_rejects_wrong_token() {
        let v = SharedSecretVerifier("correct-horse".into());
        assert!(v.verify("wrong").is_err());
        assert_eq!(v.verify("correct-horse").unwrap(), "admin");
    }

    async fn test_plane() -> Arc<ConfigPlane> {
        let src = Arc::new(StaticConfigSource::new(vec![]));
        let clock = Arc::new(FakeClock::new(0));
        Arc::new(ConfigPlane::bootstrap(src, clock).await.unwrap())
    }

    #[tokio::test]
    async fn healthz_requires_no_auth() {
        let state = Arc::new(AdminState {
            plane: test_plane().await,
            verifier: Arc::new(gateway_core::jwt::DenyAllVerifier),
            log_db: std::env::temp_dir().join("mcp-gateway-test-logs.sqlite"),
        });
        let app = admin_router(state);
        let res = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reload_rejects_without_bearer_token() {
        let state = Arc::new(AdminState {
            plane: test_plane().await,
            verifier: Arc::new(gateway_core::jwt::DenyAllVerifier),
            log_db: std::env::temp_dir().join("mcp-gateway-test-logs.sqlite"),
        });
        let app = admin_router(state);
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reload_succeeds_with_valid_token() {
        let state = Arc::new(AdminState {
            plane: test_plane().await,
            verifier: Arc::new(SharedSecretVerifier("s3cret".into())),
            log_db: std::env::temp_dir().join("mcp-gateway-test-logs.sqlite"),
        });
        let app = admin_router(state);
        let res = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/reload")
                    .header("Authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn audit_rejects_without_bearer_token() {
        let state = Arc::new(AdminState {
            plane: test_plane().await,
            verifier: Arc::new(gateway_core::jwt::DenyAllVerifier),
            log_db: std::env::temp_dir().join("mcp-gateway-test-logs.sqlite"),
        });
        let app = admin_router(state);
        let res = app
            .oneshot(Request::builder().uri("/admin/audit").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn audit_returns_logged_events_for_authorized_caller() {
        use gateway_logging::{AuditSink, Event};

        let dir = tempfile::tempdir().unwrap();
        let log_db = dir.path().join("logs.sqlite");
        let sink = gateway_logging::SqliteSink::open(log_db.clone()).await.unwrap();
        sink.log(Event::new("tenant-a", "tools/call", "sess-1"));
        sink.flush().await;

        let state = Arc::new(AdminState {
            plane: test_plane().await,
            verifier: Arc::new(SharedSecretVerifier("s3cret".into())),
            log_db,
        });
        let app = admin_router(state);
        let res = app
            .oneshot(
                Request::builder()
                    .uri("/admin/audit?tenant=tenant-a")
                    .header("Authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["events"][0]["tenant"], "tenant-a");
    }
}
