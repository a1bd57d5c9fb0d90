//! Router & transport layer (spec §4.2): builds one sub-router per
//! `RouterConfig` found in the bootstrap config snapshot, each carrying its
//! own CORS policy and `auth.mode` middleware, mounting `{prefix}/mcp`
//! (streamable-HTTP, via `rmcp`'s own session machinery) alongside a
//! hand-rolled `{prefix}{ssePrefix}` GET/POST pair backed by the gateway's
//! own `SessionManager` rather than `rmcp`'s internal SSE transport — the
//! Session Manager is a first-class gateway component here (spec §4.3), not
//! an implementation detail of one transport. See DESIGN.md.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Extension, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, extract::Request};
use futures::stream::{self, Stream};
use futures::StreamExt;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
use tower_http::cors::{Any, CorsLayer};

use gateway_core::aggregator::CapabilityAggregator;
use gateway_core::config::{AuthMode, CorsConfig, RouterConfig};
use gateway_core::oauth::server::validate_token;
use gateway_core::oauth::store::Store as OAuthStore;
use gateway_core::session::{SessionManager, SessionTransport};
use gateway_logging::{AuditSink, Event as AuditEvent};

use crate::service::GatewayRpcService;

pub struct AppState<S: AuditSink> {
    pub aggregator: Arc<CapabilityAggregator>,
    pub sessions: Arc<SessionManager>,
    pub oauth_store: Arc<dyn OAuthStore>,
    pub audit: S,
}

#[derive(Clone)]
struct RouterMeta {
    tenant: String,
    server: String,
    auth: AuthMode,
    sse_path: String,
    full_prefix: String,
}

const SSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Builds the whole HTTP surface from the routers present in `routers` at
/// boot. Adding or removing a router prefix requires a process restart in
/// this build; changes to which tools/servers a prefix exposes hot-reload
/// normally because the aggregator re-reads the config plane on every call.
pub fn build_router<S: AuditSink + Clone>(
    state: Arc<AppState<S>>,
    tenant_routers: &[(String, RouterConfig)],
) -> Router {
    let mut root = Router::new().with_state(state.clone());
    for (tenant, router_cfg) in tenant_routers {
        let sub = build_tenant_router(state.clone(), tenant.clone(), router_cfg.clone());
        let prefix = router_cfg.normalized_prefix();
        root = if prefix == "/" {
            root.merge(sub)
        } else {
            root.merge(Router::new().nest(&prefix, sub))
        };
    }
    root
}

fn build_tenant_router<S: AuditSink + Clone>(
    state: Arc<AppState<S>>,
    tenant: String,
    router_cfg: RouterConfig,
) -> Router {
    let sse_path = router_cfg
        .sse_prefix
        .clone()
        .unwrap_or_else(|| "/sse".to_string());
    let meta = Arc::new(RouterMeta {
        tenant: tenant.clone(),
        server: router_cfg.server.clone(),
        auth: router_cfg.auth.clone(),
        sse_path: sse_path.clone(),
        full_prefix: router_cfg.normalized_prefix(),
    });

    let mcp_service: StreamableHttpService<GatewayRpcService<S>, LocalSessionManager> = {
        let aggregator = state.aggregator.clone();
        let sessions = state.sessions.clone();
        let audit = state.audit.clone();
        let tenant = tenant.clone();
        let server = router_cfg.server.clone();
        StreamableHttpService::new(
            move || {
                Ok(GatewayRpcService {
                    aggregator: aggregator.clone(),
                    sessions: sessions.clone(),
                    audit: audit.clone(),
                    tenant: tenant.clone(),
                    server_name: server.clone(),
                    session_id: Arc::new(tokio::sync::RwLock::new(None)),
                })
            },
            Default::default(),
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(Duration::from_secs(15)),
            },
        )
    };

    // Layers added last run first on the way in: `Extension` must insert
    // `meta` before `auth_guard` can extract it, so it's added outermost.
    // `CatchPanicLayer` is added last of all so a panic anywhere inside —
    // including the auth/CORS layers and the mounted services — degrades
    // to a 500 instead of taking down the task.
    Router::new()
        .nest_service("/mcp", mcp_service)
        .route(&sse_path, get(sse_handler::<S>).post(message_handler::<S>))
        .layer(middleware::from_fn(auth_guard::<S>))
        .layer(cors_layer(&router_cfg.cors))
        .layer(Extension(meta))
        .layer(tower_http::catch_panic::CatchPanicLayer::new())
        .with_state(state)
}

fn cors_layer(cfg: &CorsConfig) -> CorsLayer {
    let mut layer = CorsLayer::new();
    layer = if cfg.allow_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = cfg
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(origins)
    };
    layer = if cfg.allow_methods.is_empty() {
        layer.allow_methods(Any)
    } else {
        let methods: Vec<Method> = cfg
            .allow_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer.allow_methods(methods)
    };
    layer = if cfg.allow_headers.is_empty() {
        layer.allow_headers(Any)
    } else {
        let headers: Vec<axum::http::HeaderName> = cfg
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer.allow_headers(headers)
    };
    // credentials can't combine with a wildcard origin; only opt in when
    // explicit origins are configured, matching the teacher's restrictive
    // profile over a permissive default.
    if cfg.allow_credentials && !cfg.allow_origins.is_empty() {
        layer = layer.allow_credentials(true);
    }
    layer
}

/// Dispatch by `auth.mode` (spec §4.2): `none` passes through, `bearer`/
/// `apikey` only require the configured header (or query param) to be
/// present — the gateway doesn't hold a secret to check them against, it
/// just attaches the token for downstream tool calls — and `oauth2` looks
/// the bearer token up in the OAuth2 store.
async fn auth_guard<S: AuditSink + Clone>(
    Extension(meta): Extension<Arc<RouterMeta>>,
    State(state): State<Arc<AppState<S>>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }
    match &meta.auth {
        AuthMode::None => next.run(req).await,
        AuthMode::Bearer { header } => {
            if header_value(req.headers(), header).is_some() {
                next.run(req).await
            } else {
                unauthorized(&format!("missing {header} header"))
            }
        }
        AuthMode::ApiKey { header, query_param } => {
            let in_header = header_value(req.headers(), header).is_some();
            let in_query = query_param
                .as_ref()
                .map(|q| query_value(req.uri().query().unwrap_or(""), q).is_some())
                .unwrap_or(false);
            if in_header || in_query {
                next.run(req).await
            } else {
                unauthorized("missing api key")
            }
        }
        AuthMode::OAuth2 => {
            let Some(token) = header_value(req.headers(), "Authorization")
                .and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
            else {
                return unauthorized("missing bearer token");
            };
            match validate_token(state.oauth_store.as_ref(), &token).await {
                Ok(_) => next.run(req).await,
                Err(reason) => unauthorized(reason),
            }
        }
    }
}

fn unauthorized(reason: &str) -> Response {
    (StatusCode::UNAUTHORIZED, reason.to_string()).into_response()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn query_value(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[derive(serde::Deserialize)]
struct SessionIdQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn sse_handler<S: AuditSink + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Extension(meta): Extension<Arc<RouterMeta>>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let session = state
        .sessions
        .create(meta.full_prefix.clone(), SessionTransport::Sse);
    let endpoint = format!(
        "{}{}?sessionId={}",
        meta.full_prefix, meta.sse_path, session.id
    );
    let first = SseEvent::default().event("endpoint").data(endpoint);

    let sessions = state.sessions.clone();
    let session_id = session.id.clone();
    let tail = stream::unfold(0u64, move |last_sent| {
        let sessions = sessions.clone();
        let session_id = session_id.clone();
        async move {
            loop {
                tokio::time::sleep(SSE_POLL_INTERVAL).await;
                let Ok(events) = sessions.replay_from(&session_id, last_sent) else {
                    return None;
                };
                if let Some(last) = events.last() {
                    let next_last = last.id;
                    let batch: Vec<_> = events
                        .into_iter()
                        .map(|e| {
                            SseEvent::default()
                                .id(e.id.to_string())
                                .event(e.event_type)
                                .data(e.payload.to_string())
                        })
                        .collect();
                    return Some((stream::iter(batch.into_iter().map(Ok)), next_last));
                }
            }
        }
    })
    .flatten();

    Sse::new(stream::once(async { Ok(first) }).chain(tail))
}

async fn message_handler<S: AuditSink + Clone>(
    State(state): State<Arc<AppState<S>>>,
    Extension(meta): Extension<Arc<RouterMeta>>,
    Query(q): Query<SessionIdQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gateway_logging::with_request_origin("sse", || {
        message_handler_inner(state, meta, q, headers, body)
    })
    .await
}

async fn message_handler_inner<S: AuditSink + Clone>(
    state: Arc<AppState<S>>,
    meta: Arc<RouterMeta>,
    q: SessionIdQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(session) = state.sessions.get(&q.session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    state.sessions.touch(&q.session_id);

    let Ok(envelope) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "invalid json").into_response();
    };
    let id = envelope.get("id").cloned().unwrap_or(serde_json::Value::Null);
    let method = envelope
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let params = envelope.get("params").cloned().unwrap_or(serde_json::Value::Null);

    let request_headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let start = Instant::now();
    let outcome = rpc_dispatch(
        &method,
        &params,
        &state.aggregator,
        &state.sessions,
        &session,
        &meta.server,
        &request_headers,
    )
    .await;

    let (ok, response_value) = match outcome {
        Ok(result) => (
            true,
            serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        ),
        Err(e) => (
            false,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": e.jsonrpc_code(), "message": e.to_string() }
            }),
        ),
    };

    let mut evt = AuditEvent::new(meta.tenant.clone(), method.clone(), session.id.clone());
    evt.server_name = Some(meta.server.clone());
    evt.request_json = Some(envelope);
    evt.response_json = Some(response_value.clone());
    evt.ok = ok;
    evt.duration_ms = Some(start.elapsed().as_millis() as i64);
    evt.origin = gateway_logging::current_request_origin();
    state.audit.log(evt);

    if let Err(e) = state.sessions.enqueue(&session.id, "message", response_value) {
        tracing::warn!(target = "router", session = %session.id, error = %e, "failed to enqueue sse response");
    }
    StatusCode::ACCEPTED.into_response()
}

async fn rpc_dispatch(
    method: &str,
    params: &serde_json::Value,
    aggregator: &CapabilityAggregator,
    sessions: &SessionManager,
    session: &gateway_core::session::Session,
    server_name: &str,
    request_headers: &HashMap<String, String>,
) -> Result<serde_json::Value, gateway_core::error::GatewayError> {
    use gateway_core::error::GatewayError;
    use gateway_core::session::InitializeOutcome;

    match method {
        "initialize" => match sessions.initialize(&session.id)? {
            InitializeOutcome::Initialized => Ok(serde_json::json!({
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": { "listChanged": true } },
                "serverInfo": { "name": "mcp-gateway", "version": env!("CARGO_PKG_VERSION") }
            })),
            InitializeOutcome::AlreadyInitialized => Err(GatewayError::Protocol(format!(
                "session {} already initialized",
                session.id
            ))),
        },
        "tools/list" => {
            let tools = aggregator.list_tools_for_server(server_name).await?;
            let list: Vec<_> = tools.into_iter().map(|t| t.tool).collect();
            Ok(serde_json::json!({ "tools": list }))
        }
        "tools/call" => {
            let name = params
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| GatewayError::Validation("missing tool name".into()))?;
            let args = params.get("arguments").cloned().unwrap_or(serde_json::json!({}));
            let outcome = aggregator
                .call_tool(name, &args, request_headers, Some(session))
                .await?;
            Ok(serde_json::json!({
                "content": [{ "type": "text", "text": outcome.content }],
                "isError": outcome.is_error
            }))
        }
        "prompts/list" => {
            let prompts = aggregator.list_prompts();
            let list: Vec<_> = prompts
                .into_iter()
                .map(|(name, p)| serde_json::json!({ "name": name, "description": p.description }))
                .collect();
            Ok(serde_json::json!({ "prompts": list }))
        }
        "prompts/get" => {
            let name = params
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| GatewayError::Validation("missing prompt name".into()))?;
            let prompt = aggregator.get_prompt(name)?;
            Ok(serde_json::json!({
                "description": prompt.description,
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": prompt.template }
                }]
            }))
        }
        other => Err(GatewayError::NotFound(format!("method {other}"))),
    }
}
