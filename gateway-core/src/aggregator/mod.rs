//! Capability Aggregator (spec §4.4): the union of REST-backed tools and
//! whatever upstream MCP servers expose, behind a two-layer cache. Name
//! collisions resolve first-wins in config document order, matching
//! `merge_configs`'s own append-in-order semantics.

pub mod upstream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model as mcp;
use serde_json::Value;

use crate::config::{MCPConfig, ResolvedServer};
use crate::error::{GatewayError, GatewayResult};
use crate::rest_tool::{RestToolExecutor, ToolCallOutcome};
use upstream::UpstreamSupervisor;

pub const L1_TTL: Duration = Duration::from_secs(5 * 60);
pub const L2_TTL_SECS: u64 = 30 * 60;
pub const L1_MAX_CAPACITY: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub enum ToolOrigin {
    Rest { server: String },
    Upstream { server: String },
}

#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub tool: mcp::Tool,
    pub origin: ToolOrigin,
}

/// Where `tools/list` etc. read config documents from — `ConfigPlane`
/// implements this via `current()`, decoupling the aggregator from the
/// config plane's reload machinery for testing.
pub trait ConfigView: Send + Sync {
    fn configs(&self) -> Arc<Vec<MCPConfig>>;
}

pub struct CapabilityAggregator {
    config: Arc<dyn ConfigView>,
    rest: RestToolExecutor,
    upstreams: dashmap::DashMap<String, Arc<UpstreamSupervisor>>,
    next_upstream_id: std::sync::atomic::AtomicU64,
    l1: mini_moka::sync::Cache<String, Arc<Vec<AggregatedTool>>>,
}

impl CapabilityAggregator {
    pub fn new(config: Arc<dyn ConfigView>) -> Self {
        let l1 = mini_moka::sync::Cache::builder()
            .time_to_live(L1_TTL)
            .weigher(|_k: &String, v: &Arc<Vec<AggregatedTool>>| v.len().min(u32::MAX as usize) as u32)
            .max_capacity(L1_MAX_CAPACITY)
            .build();
        Self {
            config,
            rest: RestToolExecutor::default(),
            upstreams: dashmap::DashMap::new(),
            next_upstream_id: std::sync::atomic::AtomicU64::new(1),
            l1,
        }
    }

    /// Registers (or looks up) the supervisor for an upstream server,
    /// spawning its connect loop eagerly for `onStart` policy servers. Idempotent
    /// per server name so config reload can call it unconditionally.
    pub fn upstream_for(&self, cfg: &crate::config::McpServerConfig) -> Arc<UpstreamSupervisor> {
        if let Some(existing) = self.upstreams.get(&cfg.name) {
            return existing.clone();
        }
        let id = self
            .next_upstream_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let sup = Arc::new(UpstreamSupervisor::new(id, cfg.clone()));
        if cfg.policy == crate::config::StartPolicy::OnStart {
            sup.clone().spawn_supervise_loop();
        }
        self.upstreams.insert(cfg.name.clone(), sup.clone());
        sup
    }

    fn prefixed(server: &str, name: &str) -> String {
        format!("{server}::{name}")
    }

    /// `tools/list`: unions REST tool configs (restricted to each server's
    /// `allowedTools`, or all tools if that list is empty) with upstream
    /// `tools/list` results, invalidated by config reload via cache-key
    /// versioning rather than explicit bust (the key embeds nothing
    /// version-specific, so callers needing a hard bust call
    /// `invalidate_all` after a reload — see `ConfigPlane`).
    pub async fn list_tools(&self) -> GatewayResult<Vec<AggregatedTool>> {
        const CACHE_KEY: &str = "tools:list";
        if let Some(cached) = self.l1.get(&CACHE_KEY.to_string()) {
            return Ok((*cached).clone());
        }

        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        let configs = self.config.configs();

        for cfg in configs.iter() {
            if cfg.is_tombstone() {
                continue;
            }
            for server in &cfg.servers {
                let allowed: Option<&[String]> = if server.allowed_tools.is_empty() {
                    None
                } else {
                    Some(&server.allowed_tools)
                };
                for tool in &cfg.tools {
                    if let Some(allow) = allowed {
                        if !allow.iter().any(|a| a == &tool.name) {
                            continue;
                        }
                    }
                    let full = Self::prefixed(&server.name, &tool.name);
                    if !seen.insert(full.clone()) {
                        tracing::warn!(target = "aggregator", tool = %full, "duplicate tool name, first wins");
                        continue;
                    }
                    let schema = tool
                        .input_schema
                        .clone()
                        .and_then(|v| v.as_object().cloned())
                        .unwrap_or_default();
                    out.push(AggregatedTool {
                        tool: mcp::Tool::new(full, String::new(), schema),
                        origin: ToolOrigin::Rest {
                            server: server.name.clone(),
                        },
                    });
                }
            }
            for mcp_server in &cfg.mcp_servers {
                let sup = self.upstream_for(mcp_server);
                if sup.state() != upstream::UpstreamState::Ready {
                    continue;
                }
                let Some(client) = sup.client() else { continue };
                let Ok(result) = client.list_tools(Default::default()).await else {
                    continue;
                };
                for tool in result.tools {
                    let full = Self::prefixed(&mcp_server.name, &tool.name);
                    if !seen.insert(full.clone()) {
                        tracing::warn!(target = "aggregator", tool = %full, "duplicate tool name, first wins");
                        continue;
                    }
                    let mut renamed = tool;
                    renamed.name = full.into();
                    out.push(AggregatedTool {
                        tool: renamed,
                        origin: ToolOrigin::Upstream {
                            server: mcp_server.name.clone(),
                        },
                    });
                }
            }
        }

        self.l1.insert(CACHE_KEY.to_string(), Arc::new(out.clone()));
        Ok(out)
    }

    /// Drops every cached list so the next `list_tools`/`call_tool` reflects
    /// a just-installed config snapshot.
    pub fn invalidate_all(&self) {
        self.l1.invalidate_all();
    }

    /// `tools/list` scoped to one router's declared server — a router only
    /// ever exposes the single server it names, even though the aggregate
    /// cache spans every configured server.
    pub async fn list_tools_for_server(&self, server_name: &str) -> GatewayResult<Vec<AggregatedTool>> {
        let all = self.list_tools().await?;
        Ok(all
            .into_iter()
            .filter(|t| match &t.origin {
                ToolOrigin::Rest { server } | ToolOrigin::Upstream { server } => server == server_name,
            })
            .collect())
    }

    /// `tools/call`: splits the `server::tool` name, resolves it against a
    /// REST `ToolConfig` or forwards to the matching upstream client. When
    /// `session` is given and the tool resolves to an upstream server, the
    /// session's `UpstreamHandle` is checked for staleness (the supervisor
    /// having restarted since the last call) and rebound after the call
    /// resolves against the current connector.
    pub async fn call_tool(
        &self,
        full_name: &str,
        args: &Value,
        request_headers: &HashMap<String, String>,
        session: Option<&crate::session::Session>,
    ) -> GatewayResult<ToolCallOutcome> {
        let (server_name, tool_name) = full_name.split_once("::").ok_or_else(|| {
            GatewayError::Validation(format!("tool name {full_name} is not server::tool"))
        })?;

        let configs = self.config.configs();
        for cfg in configs.iter() {
            if cfg.is_tombstone() {
                continue;
            }
            match cfg.resolve_server(server_name) {
                Some(ResolvedServer::Rest(server)) => {
                    if !server.allowed_tools.is_empty()
                        && !server.allowed_tools.iter().any(|a| a == tool_name)
                    {
                        continue;
                    }
                    if let Some(tool) = cfg.tools.iter().find(|t| t.name == tool_name) {
                        return self.rest.execute(tool, server, args, request_headers).await;
                    }
                }
                Some(ResolvedServer::Upstream(mcp_server)) => {
                    let sup = self.upstream_for(mcp_server);
                    if let Some(session) = session {
                        if let Some(handle) = session.upstream_handle() {
                            if sup.is_stale(handle) {
                                tracing::info!(
                                    target = "aggregator",
                                    server = %server_name,
                                    session = %session.id,
                                    "upstream handle stale, rebinding"
                                );
                            }
                        }
                    }
                    sup.ensure_ready(Duration::from_secs(
                        upstream::DEFAULT_HANDSHAKE_TIMEOUT_SECS,
                    ))
                    .await?;
                    if let Some(session) = session {
                        session.bind_upstream(sup.handle());
                    }
                    let client = sup.client().ok_or_else(|| {
                        GatewayError::UpstreamUnavailable(format!("{server_name} not connected"))
                    })?;
                    let params = mcp::CallToolRequestParam {
                        name: tool_name.to_string().into(),
                        arguments: args.as_object().cloned(),
                    };
                    let result = client.call_tool(params).await.map_err(|e| {
                        GatewayError::UpstreamProtocol(format!("calling {full_name}: {e}"))
                    })?;
                    let content = result
                        .content
                        .into_iter()
                        .filter_map(|c| c.as_text().map(|t| t.text.clone()))
                        .collect::<Vec<_>>()
                        .join("\n");
                    return Ok(ToolCallOutcome {
                        content,
                        is_error: result.is_error.unwrap_or(false),
                    });
                }
                None => {}
            }
        }
        Err(GatewayError::NotFound(format!("tool {full_name}")))
    }

    /// `prompts/list`: REST-configured prompt templates, prefixed the same
    /// way tools are.
    pub fn list_prompts(&self) -> Vec<(String, crate::config::PromptConfig)> {
        let configs = self.config.configs();
        let mut out = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for cfg in configs.iter() {
            if cfg.is_tombstone() {
                continue;
            }
            for server in &cfg.servers {
                for prompt in &cfg.prompts {
                    let full = Self::prefixed(&server.name, &prompt.name);
                    if seen.insert(full.clone()) {
                        out.push((full, prompt.clone()));
                    }
                }
            }
        }
        out
    }

    pub fn get_prompt(&self, full_name: &str) -> GatewayResult<crate::config::PromptConfig> {
        self.list_prompts()
            .into_iter()
            .find(|(name, _)| name == full_name)
            .map(|(_, p)| p)
            .ok_or_else(|| GatewayError::NotFound(format!("prompt {full_name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArgConfig, ServerConfig, ToolConfig};

    struct StaticView(Arc<Vec<MCPConfig>>);
    impl ConfigView for StaticView {
        fn configs(&self) -> Arc<Vec<MCPConfig>> {
            self.0.clone()
        }
    }

    fn cfg_with_tool(tool_name: &str, allowed: Vec<String>) -> MCPConfig {
        MCPConfig {
            tenant: "t".into(),
            name: "n".into(),
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            routers: vec![],
            servers: vec![ServerConfig {
                name: "svc".into(),
                description: None,
                allowed_tools: allowed,
                config: HashMap::new(),
            }],
            tools: vec![ToolConfig {
                name: tool_name.into(),
                method: "GET".into(),
                endpoint: "https://example.test".into(),
                proxy: None,
                headers: HashMap::new(),
                args: Vec::<ArgConfig>::new(),
                request_body: None,
                response_body: None,
                input_schema: None,
            }],
            prompts: vec![],
            mcp_servers: vec![],
        }
    }

    #[tokio::test]
    async fn list_tools_respects_allowed_tools_and_prefixes_name() {
        let cfg = cfg_with_tool("echo", vec!["echo".into()]);
        let agg = CapabilityAggregator::new(Arc::new(StaticView(Arc::new(vec![cfg]))));
        let tools = agg.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool.name, "svc::echo");
    }

    #[tokio::test]
    async fn list_tools_excludes_tool_not_in_allowed_list() {
        let cfg = cfg_with_tool("echo", vec!["other".into()]);
        let agg = CapabilityAggregator::new(Arc::new(StaticView(Arc::new(vec![cfg]))));
        let tools = agg.list_tools().await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn call_tool_rejects_unprefixed_name() {
        let cfg = cfg_with_tool("echo", vec![]);
        let agg = CapabilityAggregator::new(Arc::new(StaticView(Arc::new(vec![cfg]))));
        let err = agg
            .call_tool("echo", &serde_json::json!({}), &HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
