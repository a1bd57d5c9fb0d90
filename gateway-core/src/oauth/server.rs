//! HTTP surface for the OAuth2 authorization server: `/authorize`,
//! `/token`, `/register`, `/revoke`, and the discovery metadata document.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use super::store::Store;
use super::{
    AuthorizationCode, Client, PkceMethod, Token, CODE_TTL_SECS, TOKEN_TTL_SECS, constant_time_eq,
    random_token, redirect_uri_matches, verify_pkce,
};
use crate::clock::Clock;

pub struct OAuthServerState {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
}

pub fn oauth_router(state: Arc<OAuthServerState>) -> Router {
    Router::new()
        .route("/authorize", get(authorize))
        .route("/token", post(token))
        .route("/register", post(register))
        .route("/revoke", post(revoke))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct OAuthError {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_description: Option<String>,
}

fn oauth_error(status: StatusCode, error: &'static str, description: impl Into<String>) -> Response {
    (
        status,
        Json(OAuthError {
            error,
            error_description: Some(description.into()),
        }),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    response_type: String,
    state: Option<String>,
    scope: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
}

#[derive(Debug, Serialize)]
struct AuthorizeResponse {
    code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
}

async fn authorize(
    State(state): State<Arc<OAuthServerState>>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    if params.response_type != "code" {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_response_type",
            "only response_type=code is supported",
        );
    }
    let client = match state.store.get_client(&params.client_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            return oauth_error(StatusCode::BAD_REQUEST, "invalid_client", "unknown client_id");
        }
        Err(e) => return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
    };
    if !client
        .redirect_uris
        .iter()
        .any(|r| redirect_uri_matches(r, &params.redirect_uri))
    {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "redirect_uri mismatch");
    }

    let code_challenge_method = match params.code_challenge_method.as_deref() {
        Some("plain") => Some(PkceMethod::Plain),
        Some("S256") => Some(PkceMethod::S256),
        Some(other) => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unsupported code_challenge_method {other}"),
            );
        }
        None => None,
    };

    let now = state.clock.now_unix_secs();
    let code = AuthorizationCode {
        code: random_token(),
        client_id: client.id.clone(),
        redirect_uri: params.redirect_uri.clone(),
        scope: params.scope.unwrap_or_else(|| client.scope.clone()),
        code_challenge: params.code_challenge,
        code_challenge_method,
        expires_at: now + CODE_TTL_SECS,
        created_at: now,
    };
    let response = AuthorizeResponse {
        code: code.code.clone(),
        state: params.state,
    };
    if let Err(e) = state.store.put_code(code).await {
        return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string());
    }
    Json(response).into_response()
}

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: i64,
}

fn basic_auth_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (id, secret) = text.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

async fn authenticate_client(
    store: &dyn Store,
    headers: &HeaderMap,
    req: &TokenRequest,
) -> Result<Client, Response> {
    let (client_id, client_secret) = if let Some(basic) = basic_auth_credentials(headers) {
        basic
    } else {
        match (&req.client_id, &req.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => {
                return Err(oauth_error(
                    StatusCode::UNAUTHORIZED,
                    "invalid_client",
                    "missing client credentials",
                ));
            }
        }
    };
    let client = match store.get_client(&client_id).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            return Err(oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "unknown client"));
        }
        Err(e) => {
            return Err(oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()));
        }
    };
    if !constant_time_eq(client.secret.as_bytes(), client_secret.as_bytes()) {
        return Err(oauth_error(StatusCode::UNAUTHORIZED, "invalid_client", "bad client_secret"));
    }
    Ok(client)
}

async fn token(
    State(state): State<Arc<OAuthServerState>>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    let client = match authenticate_client(state.store.as_ref(), &headers, &req).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match req.grant_type.as_str() {
        "authorization_code" => authorization_code_grant(&state, &client, &req).await,
        "refresh_token" => refresh_token_grant(&state, &client, &req).await,
        other => oauth_error(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            format!("unsupported grant_type {other}"),
        ),
    }
}

async fn authorization_code_grant(
    state: &OAuthServerState,
    client: &Client,
    req: &TokenRequest,
) -> Response {
    let Some(code_str) = &req.code else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing code");
    };
    let code = match state.store.take_code(code_str).await {
        Ok(Some(c)) => c,
        Ok(None) => {
            return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "code_expired_or_unknown");
        }
        Err(e) => return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
    };
    if code.client_id != client.id {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "client_id mismatch");
    }
    if Some(&code.redirect_uri) != req.redirect_uri.as_ref() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "redirect_uri mismatch");
    }
    if let Some(method) = code.code_challenge_method {
        let challenge = code.code_challenge.as_deref().unwrap_or_default();
        match &req.code_verifier {
            None => {
                return oauth_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    "code_verifier required",
                );
            }
            Some(verifier) if !verify_pkce(method, challenge, verifier) => {
                return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "pkce verification failed");
            }
            Some(_) => {}
        }
    }

    let now = state.clock.now_unix_secs();
    let token = Token {
        access_token: random_token(),
        refresh_token: random_token(),
        token_type: "Bearer".to_string(),
        client_id: client.id.clone(),
        scope: code.scope,
        expires_at: now + TOKEN_TTL_SECS,
        created_at: now,
    };
    let resp = TokenResponse {
        access_token: token.access_token.clone(),
        refresh_token: token.refresh_token.clone(),
        token_type: token.token_type.clone(),
        expires_in: TOKEN_TTL_SECS,
    };
    if let Err(e) = state.store.put_token(token).await {
        return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string());
    }
    Json(resp).into_response()
}

async fn refresh_token_grant(
    state: &OAuthServerState,
    client: &Client,
    req: &TokenRequest,
) -> Response {
    let Some(refresh) = &req.refresh_token else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "missing refresh_token");
    };
    let existing = match state.store.get_token_by_refresh(refresh).await {
        Ok(Some(t)) => t,
        Ok(None) => return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "unknown refresh_token"),
        Err(e) => return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
    };
    if existing.client_id != client.id {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", "client_id mismatch");
    }
    let now = state.clock.now_unix_secs();
    // Per Design Notes §9 Open Questions: the refresh flow reissues the
    // access token but deliberately leaves the refresh token unchanged and
    // does not delete the prior access token — see DESIGN.md for why this
    // is kept as observed rather than "fixed".
    let new_token = Token {
        access_token: random_token(),
        refresh_token: existing.refresh_token.clone(),
        token_type: "Bearer".to_string(),
        client_id: existing.client_id.clone(),
        scope: existing.scope.clone(),
        expires_at: now + TOKEN_TTL_SECS,
        created_at: now,
    };
    let resp = TokenResponse {
        access_token: new_token.access_token.clone(),
        refresh_token: new_token.refresh_token.clone(),
        token_type: new_token.token_type.clone(),
        expires_in: TOKEN_TTL_SECS,
    };
    if let Err(e) = state.store.put_token(new_token).await {
        return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string());
    }
    Json(resp).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    redirect_uris: Vec<String>,
    #[serde(default)]
    grant_types: Option<Vec<String>>,
    #[serde(default)]
    response_types: Option<Vec<String>>,
    #[serde(default)]
    token_endpoint_auth_method: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    client_id: String,
    client_secret: String,
    redirect_uris: Vec<String>,
    grant_types: Vec<String>,
    response_types: Vec<String>,
    token_endpoint_auth_method: String,
    scope: String,
}

async fn register(
    State(state): State<Arc<OAuthServerState>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    if req.redirect_uris.is_empty() {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_redirect_uri", "redirect_uris is required");
    }
    let now = state.clock.now_unix_secs();
    let client = Client {
        id: uuid::Uuid::new_v4().to_string(),
        secret: random_token(),
        redirect_uris: req.redirect_uris,
        grant_types: req
            .grant_types
            .unwrap_or_else(|| vec!["authorization_code".into(), "refresh_token".into()]),
        response_types: req.response_types.unwrap_or_else(|| vec!["code".into()]),
        token_endpoint_auth_method: req
            .token_endpoint_auth_method
            .unwrap_or_else(|| "client_secret_basic".into()),
        scope: req.scope.unwrap_or_else(|| "openid profile email".into()),
        created_at: now,
        updated_at: now,
    };
    let resp = RegisterResponse {
        client_id: client.id.clone(),
        client_secret: client.secret.clone(),
        redirect_uris: client.redirect_uris.clone(),
        grant_types: client.grant_types.clone(),
        response_types: client.response_types.clone(),
        token_endpoint_auth_method: client.token_endpoint_auth_method.clone(),
        scope: client.scope.clone(),
    };
    if let Err(e) = state.store.put_client(client).await {
        return oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string());
    }
    (StatusCode::CREATED, Json(resp)).into_response()
}

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: String,
}

async fn revoke(
    State(state): State<Arc<OAuthServerState>>,
    Form(req): Form<RevokeRequest>,
) -> Response {
    match state.store.delete_token_by_access(&req.token).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => oauth_error(StatusCode::INTERNAL_SERVER_ERROR, "server_error", e.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct Metadata {
    issuer: String,
    authorization_endpoint: String,
    token_endpoint: String,
    registration_endpoint: String,
    revocation_endpoint: String,
    token_endpoint_auth_methods_supported: Vec<&'static str>,
    response_types_supported: Vec<&'static str>,
    grant_types_supported: Vec<&'static str>,
    code_challenge_methods_supported: Vec<&'static str>,
}

async fn metadata(headers: HeaderMap) -> Json<Metadata> {
    let issuer = issuer_from_headers(&headers);
    Json(Metadata {
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/token"),
        registration_endpoint: format!("{issuer}/register"),
        revocation_endpoint: format!("{issuer}/revoke"),
        issuer,
        token_endpoint_auth_methods_supported: vec![
            "client_secret_basic",
            "client_secret_post",
            "none",
        ],
        response_types_supported: vec!["code"],
        grant_types_supported: vec!["authorization_code", "refresh_token"],
        code_challenge_methods_supported: vec!["plain", "S256"],
    })
}

fn issuer_from_headers(headers: &HeaderMap) -> String {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("{proto}://{host}")
}

/// Shared by auth middleware (spec §4.2) to validate an incoming bearer
/// token against the OAuth2 store.
pub async fn validate_token(store: &dyn Store, token: &str) -> Result<Token, &'static str> {
    match store.get_token_by_access(token).await {
        Ok(Some(t)) => Ok(t),
        Ok(None) => Err("invalid_token"),
        Err(_) => Err("server_error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::oauth::store::InMemoryStore;

    fn state() -> Arc<OAuthServerState> {
        let clock = Arc::new(FakeClock::new(1_000_000));
        Arc::new(OAuthServerState {
            store: Arc::new(InMemoryStore::new(clock.clone())),
            clock,
        })
    }

    async fn registered_client(state: &OAuthServerState, redirect_uri: &str) -> Client {
        let now = state.clock.now_unix_secs();
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            secret: random_token(),
            redirect_uris: vec![redirect_uri.to_string()],
            grant_types: vec!["authorization_code".into(), "refresh_token".into()],
            response_types: vec!["code".into()],
            token_endpoint_auth_method: "client_secret_basic".into(),
            scope: "mcp".into(),
            created_at: now,
            updated_at: now,
        };
        state.store.put_client(client.clone()).await.unwrap();
        client
    }

    #[tokio::test]
    async fn register_endpoint_applies_dcr_defaults() {
        let state = state();
        let req = RegisterRequest {
            redirect_uris: vec!["http://app/cb".into()],
            grant_types: None,
            response_types: None,
            token_endpoint_auth_method: None,
            scope: None,
        };
        let resp = register(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn register_rejects_empty_redirect_uris() {
        let state = state();
        let req = RegisterRequest {
            redirect_uris: vec![],
            grant_types: None,
            response_types: None,
            token_endpoint_auth_method: None,
            scope: None,
        };
        let resp = register(State(state.clone()), Json(req)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn authorize_then_token_then_reuse_rejected() {
        let state = state();
        let client = registered_client(&state, "http://app/cb").await;

        let authorize_params = AuthorizeParams {
            client_id: client.id.clone(),
            redirect_uri: "http://app/cb".into(),
            response_type: "code".into(),
            state: Some("xyz".into()),
            scope: None,
            code_challenge: None,
            code_challenge_method: None,
        };
        let resp = authorize(State(state.clone()), Query(authorize_params))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: AuthorizeResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.state.as_deref(), Some("xyz"));

        let token_req = TokenRequest {
            grant_type: "authorization_code".into(),
            code: Some(parsed.code.clone()),
            redirect_uri: Some("http://app/cb".into()),
            code_verifier: None,
            refresh_token: None,
            client_id: Some(client.id.clone()),
            client_secret: Some(client.secret.clone()),
        };
        let resp = authorization_code_grant(&state, &client, &token_req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Reusing the same code must fail (single-use).
        let resp = authorization_code_grant(&state, &client, &token_req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pkce_mismatch_is_rejected_at_token() {
        let state = state();
        let client = registered_client(&state, "http://app/cb").await;
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = super::super::s256_challenge(verifier);

        let authorize_params = AuthorizeParams {
            client_id: client.id.clone(),
            redirect_uri: "http://app/cb".into(),
            response_type: "code".into(),
            state: None,
            scope: None,
            code_challenge: Some(challenge),
            code_challenge_method: Some("S256".into()),
        };
        let resp = authorize(State(state.clone()), Query(authorize_params))
            .await
            .into_response();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: AuthorizeResponse = serde_json::from_slice(&body).unwrap();

        let token_req = TokenRequest {
            grant_type: "authorization_code".into(),
            code: Some(parsed.code),
            redirect_uri: Some("http://app/cb".into()),
            code_verifier: Some("wrong-verifier-12345678901234567890123".into()),
            refresh_token: None,
            client_id: Some(client.id.clone()),
            client_secret: Some(client.secret.clone()),
        };
        let resp = authorization_code_grant(&state, &client, &token_req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn client_secret_must_match() {
        let state = state();
        let client = registered_client(&state, "http://app/cb").await;
        let headers = HeaderMap::new();
        let req = TokenRequest {
            grant_type: "authorization_code".into(),
            code: None,
            redirect_uri: None,
            code_verifier: None,
            refresh_token: None,
            client_id: Some(client.id.clone()),
            client_secret: Some("wrong-secret".into()),
        };
        let result = authenticate_client(state.store.as_ref(), &headers, &req).await;
        assert!(result.is_err());
    }
}
