//! `GatewayRpcService`: the `rmcp::Service<RoleServer>` implementation
//! mounted under `{prefix}/mcp` for the streamable-HTTP transport. Mirrors
//! the teacher's `BouncerService` shape — the same three request variants
//! are handled, everything else falls back to an empty result — but tools
//! are resolved through the gateway's own `CapabilityAggregator` and
//! `ToolConfig`/`McpServerConfig` documents instead of a single enabled
//! upstream list.

use std::sync::Arc;
use std::time::Instant;

use rmcp::model as mcp;
use rmcp::{RoleServer, Service as McpService};

use gateway_core::aggregator::CapabilityAggregator;
use gateway_core::session::{SessionManager, SessionTransport};
use gateway_logging::{AuditSink, Event as AuditEvent};

#[derive(Clone)]
pub struct GatewayRpcService<S: AuditSink> {
    pub aggregator: Arc<CapabilityAggregator>,
    pub sessions: Arc<SessionManager>,
    pub audit: S,
    pub tenant: String,
    pub server_name: String,
    pub session_id: Arc<tokio::sync::RwLock<Option<String>>>,
}

impl<S: AuditSink> McpService<RoleServer> for GatewayRpcService<S> {
    async fn handle_request(
        &self,
        request: mcp::ClientRequest,
        context: rmcp::service::RequestContext<RoleServer>,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        gateway_logging::with_request_origin("streamable_http", || {
            self.handle_request_inner(request, context)
        })
        .await
    }

    async fn handle_notification(
        &self,
        _notification: mcp::ClientNotification,
        _context: rmcp::service::NotificationContext<RoleServer>,
    ) -> Result<(), mcp::ErrorData> {
        Ok(())
    }

    fn get_info(&self) -> mcp::ServerInfo {
        mcp::ServerInfo {
            protocol_version: mcp::ProtocolVersion::V_2025_03_26,
            capabilities: mcp::ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: mcp::Implementation {
                name: "mcp-gateway".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: None,
        }
    }
}

impl<S: AuditSink> GatewayRpcService<S> {
    async fn handle_request_inner(
        &self,
        request: mcp::ClientRequest,
        _context: rmcp::service::RequestContext<RoleServer>,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let start = Instant::now();
        let req_json = serde_json::to_value(&request).ok();

        match request {
            mcp::ClientRequest::InitializeRequest(_req) => {
                let existing = self.session_id.read().await.clone();
                let sid = match existing {
                    Some(id) => id,
                    None => {
                        let session = self
                            .sessions
                            .create(self.tenant.clone(), SessionTransport::StreamableHttp);
                        *self.session_id.write().await = Some(session.id.clone());
                        session.id
                    }
                };
                match self.sessions.initialize(&sid).map_err(to_error_data)? {
                    gateway_core::session::InitializeOutcome::Initialized => {}
                    gateway_core::session::InitializeOutcome::AlreadyInitialized => {
                        return Err(to_error_data(gateway_core::error::GatewayError::Protocol(
                            format!("session {sid} already initialized"),
                        )));
                    }
                }
                let result = mcp::InitializeResult {
                    protocol_version: mcp::ProtocolVersion::V_2025_03_26,
                    capabilities: mcp::ServerCapabilities::builder()
                        .enable_logging()
                        .enable_tools()
                        .enable_tool_list_changed()
                        .build(),
                    server_info: mcp::Implementation {
                        name: "mcp-gateway".into(),
                        version: env!("CARGO_PKG_VERSION").into(),
                        title: None,
                        website_url: None,
                        icons: None,
                    },
                    instructions: None,
                };
                let out = mcp::ServerResult::InitializeResult(result);
                let mut e = AuditEvent::new(self.tenant.clone(), "initialize", sid);
                e.server_name = Some(self.server_name.clone());
                e.request_json = req_json;
                e.response_json = serde_json::to_value(&out).ok();
                e.ok = true;
                e.duration_ms = Some(start.elapsed().as_millis() as i64);
                e.origin = gateway_logging::current_request_origin();
                self.audit.log(e);
                Ok(out)
            }
            mcp::ClientRequest::ListToolsRequest(_req) => {
                let sid = self.current_session_id().await;
                let tools = self
                    .aggregator
                    .list_tools_for_server(&self.server_name)
                    .await
                    .map_err(to_error_data)?
                    .into_iter()
                    .map(|t| t.tool)
                    .collect();
                let out = mcp::ServerResult::ListToolsResult(mcp::ListToolsResult {
                    tools,
                    next_cursor: None,
                });
                let mut e = AuditEvent::new(self.tenant.clone(), "tools/list", sid);
                e.server_name = Some(self.server_name.clone());
                e.request_json = req_json;
                e.response_json = serde_json::to_value(&out).ok();
                e.ok = true;
                e.duration_ms = Some(start.elapsed().as_millis() as i64);
                e.origin = gateway_logging::current_request_origin();
                self.audit.log(e);
                Ok(out)
            }
            mcp::ClientRequest::CallToolRequest(req) => {
                let sid = self.current_session_id().await;
                let name = req.params.name.to_string();
                let args = req
                    .params
                    .arguments
                    .clone()
                    .map(serde_json::Value::Object)
                    .unwrap_or(serde_json::Value::Null);
                let headers = std::collections::HashMap::new();
                let session = self.sessions.get(&sid);
                let out = match self
                    .aggregator
                    .call_tool(&name, &args, &headers, session.as_deref())
                    .await
                {
                    Ok(outcome) => mcp::ServerResult::CallToolResult(mcp::CallToolResult {
                        content: vec![mcp::Content::text(outcome.content)],
                        structured_content: None,
                        is_error: Some(outcome.is_error),
                        meta: None,
                    }),
                    Err(e) => mcp::ServerResult::CallToolResult(mcp::CallToolResult {
                        content: vec![mcp::Content::text(e.to_string())],
                        structured_content: None,
                        is_error: Some(true),
                        meta: None,
                    }),
                };
                let is_ok = !matches!(&out, mcp::ServerResult::CallToolResult(r) if r.is_error == Some(true));
                let mut e = AuditEvent::new(self.tenant.clone(), "tools/call", sid);
                e.server_name = Some(self.server_name.clone());
                e.request_json = req_json;
                e.response_json = serde_json::to_value(&out).ok();
                e.ok = is_ok;
                e.duration_ms = Some(start.elapsed().as_millis() as i64);
                e.origin = gateway_logging::current_request_origin();
                self.audit.log(e);
                Ok(out)
            }
            _other => {
                let out = mcp::ServerResult::empty(());
                let sid = self.current_session_id().await;
                let mut e = AuditEvent::new(self.tenant.clone(), "other", sid);
                e.server_name = Some(self.server_name.clone());
                e.request_json = req_json;
                e.response_json = serde_json::to_value(&out).ok();
                e.ok = true;
                e.duration_ms = Some(start.elapsed().as_millis() as i64);
                e.origin = gateway_logging::current_request_origin();
                self.audit.log(e);
                Ok(out)
            }
        }
    }

    async fn current_session_id(&self) -> String {
        self.session_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| "anon".into())
    }
}

fn to_error_data(e: gateway_core::error::GatewayError) -> mcp::ErrorData {
    match e {
        gateway_core::error::GatewayError::Protocol(msg) => {
            mcp::ErrorData::invalid_request(msg, None)
        }
        other => mcp::ErrorData::internal_error(other.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sessions() -> Arc<SessionManager> {
        Arc::new(SessionManager::new(Arc::new(
            gateway_core::clock::test_support::FakeClock::new(0),
        )))
    }

    #[tokio::test]
    async fn current_session_id_defaults_to_anon_before_initialize() {
        let svc = GatewayRpcService {
            aggregator: Arc::new(CapabilityAggregator::new(Arc::new(EmptyView))),
            sessions: test_sessions(),
            audit: gateway_logging::NullSink,
            tenant: "t".into(),
            server_name: "svc".into(),
            session_id: Arc::new(tokio::sync::RwLock::new(None)),
        };
        assert_eq!(svc.current_session_id().await, "anon");
    }

    #[tokio::test]
    async fn current_session_id_reflects_initialize() {
        let svc = GatewayRpcService {
            aggregator: Arc::new(CapabilityAggregator::new(Arc::new(EmptyView))),
            sessions: test_sessions(),
            audit: gateway_logging::NullSink,
            tenant: "t".into(),
            server_name: "svc".into(),
            session_id: Arc::new(tokio::sync::RwLock::new(Some("sess-1".into()))),
        };
        assert_eq!(svc.current_session_id().await, "sess-1");
    }

    #[test]
    fn to_error_data_carries_message() {
        let err = gateway_core::error::GatewayError::NotFound("tool foo".into());
        let data = to_error_data(err);
        assert!(data.message.contains("tool foo"));
    }

    #[test]
    fn to_error_data_maps_protocol_error_to_invalid_request() {
        let err = gateway_core::error::GatewayError::Protocol("already initialized".into());
        let data = to_error_data(err);
        let expected = mcp::ErrorData::invalid_request("already initialized".to_string(), None);
        assert_eq!(data.code, expected.code);
        assert!(data.message.contains("already initialized"));
    }

    struct EmptyView;
    impl gateway_core::aggregator::ConfigView for EmptyView {
        fn configs(&self) -> Arc<Vec<gateway_core::config::MCPConfig>> {
            Arc::new(vec![])
        }
    }
}
