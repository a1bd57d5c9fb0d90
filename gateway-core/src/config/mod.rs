//! Config plane: the data model (spec §3), validation and merge rules
//! (§4.1), plus the `store`/`source`/`plane` submodules that turn a set of
//! `MCPConfig` documents into a watched, versioned, hot-reloadable snapshot.

pub mod plane;
pub mod source;
pub mod store;

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

pub const MAX_NAME_LEN: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MCPConfig {
    pub tenant: String,
    pub name: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    /// Non-zero marks this document a tombstone: on merge it removes the
    /// matching `(tenant, name)` entry rather than replacing it.
    #[serde(default)]
    pub deleted_at: i64,
    #[serde(default)]
    pub routers: Vec<RouterConfig>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub prompts: Vec<PromptConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl MCPConfig {
    pub fn is_tombstone(&self) -> bool {
        self.deleted_at != 0
    }

    pub fn key(&self) -> (String, String) {
        (self.tenant.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CorsConfig {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Bearer {
        #[serde(default = "default_bearer_header")]
        header: String,
    },
    #[serde(rename = "apikey")]
    ApiKey {
        #[serde(default = "default_apikey_header")]
        header: String,
        #[serde(default)]
        query_param: Option<String>,
    },
    #[serde(rename = "oauth2")]
    OAuth2,
}

fn default_bearer_header() -> String {
    "Authorization".to_string()
}

fn default_apikey_header() -> String {
    "X-API-Key".to_string()
}

impl Default for AuthMode {
    fn default() -> Self {
        AuthMode::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Name of a `ServerConfig` or `McpServerConfig` in the same config.
    pub server: String,
    pub prefix: String,
    #[serde(default)]
    pub sse_prefix: Option<String>,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub auth: AuthMode,
}

impl RouterConfig {
    /// Trailing `/` trimmed, empty normalizes to `/`.
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgPosition {
    Header,
    Query,
    Path,
    Body,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArgType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArgConfig {
    pub name: String,
    pub position: ArgPosition,
    #[serde(rename = "type")]
    pub arg_type: ArgType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub items: Option<Box<ArgConfig>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyScheme {
    Http,
    Https,
    Socks5,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub endpoint: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub args: Vec<ArgConfig>,
    #[serde(default)]
    pub request_body: Option<String>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub template: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StartPolicy {
    OnStart,
    OnDemand,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportKind {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
    StreamableHttp {
        url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportKind,
    #[serde(default = "default_policy")]
    pub policy: StartPolicy,
    #[serde(default)]
    pub preinstalled: bool,
}

fn default_policy() -> StartPolicy {
    StartPolicy::OnDemand
}

/// Either side of a `router.server` resolution.
pub enum ResolvedServer<'a> {
    Rest(&'a ServerConfig),
    Upstream(&'a McpServerConfig),
}

impl MCPConfig {
    pub fn resolve_server<'a>(&'a self, name: &str) -> Option<ResolvedServer<'a>> {
        if let Some(s) = self.servers.iter().find(|s| s.name == name) {
            return Some(ResolvedServer::Rest(s));
        }
        self.mcp_servers
            .iter()
            .find(|s| s.name == name)
            .map(ResolvedServer::Upstream)
    }
}

/// Validates a single config document in isolation: name length, uniqueness
/// of server/tool names, router.server resolution, allowedTools existence.
pub fn validate_config(cfg: &MCPConfig) -> GatewayResult<()> {
    if cfg.name.len() > MAX_NAME_LEN {
        return Err(GatewayError::Validation(format!(
            "config {}/{}: name exceeds {} characters",
            cfg.tenant, cfg.name, MAX_NAME_LEN
        )));
    }

    let mut server_names = HashSet::new();
    for s in &cfg.servers {
        if !server_names.insert(s.name.as_str()) {
            return Err(GatewayError::Validation(format!(
                "config {}/{}: duplicate server name {}",
                cfg.tenant, cfg.name, s.name
            )));
        }
    }
    for s in &cfg.mcp_servers {
        if !server_names.insert(s.name.as_str()) {
            return Err(GatewayError::Validation(format!(
                "config {}/{}: duplicate server name {}",
                cfg.tenant, cfg.name, s.name
            )));
        }
    }

    let mut tool_names = HashSet::new();
    for t in &cfg.tools {
        if !tool_names.insert(t.name.as_str()) {
            return Err(GatewayError::Validation(format!(
                "config {}/{}: duplicate tool name {}",
                cfg.tenant, cfg.name, t.name
            )));
        }
    }

    for r in &cfg.routers {
        if cfg.resolve_server(&r.server).is_none() {
            return Err(GatewayError::Validation(format!(
                "config {}/{}: router prefix {} references unknown server {}",
                cfg.tenant, cfg.name, r.prefix, r.server
            )));
        }
    }

    for s in &cfg.servers {
        for allowed in &s.allowed_tools {
            if !tool_names.contains(allowed.as_str()) {
                return Err(GatewayError::Validation(format!(
                    "config {}/{}: server {} allowedTools references unknown tool {}",
                    cfg.tenant, cfg.name, s.name, allowed
                )));
            }
        }
    }

    Ok(())
}

/// Validates uniqueness of normalized router prefixes across the whole
/// active set. Returns an error naming every config that collides.
pub fn validate_prefix_uniqueness(configs: &[MCPConfig]) -> GatewayResult<()> {
    let mut seen: HashMap<String, String> = HashMap::new();
    for cfg in configs {
        if cfg.is_tombstone() {
            continue;
        }
        for r in &cfg.routers {
            let p = r.normalized_prefix();
            let owner = format!("{}/{}", cfg.tenant, cfg.name);
            if let Some(existing) = seen.get(&p) {
                if existing != &owner {
                    return Err(GatewayError::Validation(format!(
                        "prefix {} is claimed by both {} and {}",
                        p, existing, owner
                    )));
                }
            } else {
                seen.insert(p, owner);
            }
        }
    }
    Ok(())
}

/// Validates every config in the set individually, then cross-config prefix
/// uniqueness. A failure leaves the caller free to keep the prior snapshot.
pub fn validate_all(configs: &[MCPConfig]) -> GatewayResult<()> {
    for cfg in configs {
        if cfg.is_tombstone() {
            continue;
        }
        validate_config(cfg)?;
    }
    validate_prefix_uniqueness(configs)
}

/// Cross-config `server::tool` name collisions among REST-backed tools —
/// the aggregator resolves these first-wins in config order, so a collision
/// is a warning, not a validation failure. Upstream MCP servers can collide
/// too, but their tool names aren't known until query time, so those are
/// caught separately in `CapabilityAggregator::list_tools`.
pub fn detect_tool_name_collisions(configs: &[MCPConfig]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut collisions = Vec::new();
    for cfg in configs {
        if cfg.is_tombstone() {
            continue;
        }
        for server in &cfg.servers {
            for tool in &cfg.tools {
                let full = format!("{}::{}", server.name, tool.name);
                if !seen.insert(full.clone()) {
                    collisions.push(full);
                }
            }
        }
    }
    collisions
}

/// Deterministic, order-preserving merge: a tombstone removes the matching
/// `(tenant, name)`; otherwise the new doc replaces an existing entry with
/// the same key in place, or is appended.
pub fn merge_configs(existing: &[MCPConfig], new: MCPConfig) -> Vec<MCPConfig> {
    let key = new.key();
    if new.is_tombstone() {
        return existing
            .iter()
            .filter(|c| c.key() != key)
            .cloned()
            .collect();
    }
    let mut out = Vec::with_capacity(existing.len() + 1);
    let mut replaced = false;
    for c in existing {
        if c.key() == key {
            out.push(new.clone());
            replaced = true;
        } else {
            out.push(c.clone());
        }
    }
    if !replaced {
        out.push(new);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(tenant: &str, name: &str) -> MCPConfig {
        MCPConfig {
            tenant: tenant.to_string(),
            name: name.to_string(),
            created_at: 0,
            updated_at: 0,
            deleted_at: 0,
            routers: vec![],
            servers: vec![],
            tools: vec![],
            prompts: vec![],
            mcp_servers: vec![],
        }
    }

    #[test]
    fn name_length_boundary() {
        let mut cfg = base("t", &"a".repeat(50));
        assert!(validate_config(&cfg).is_ok());
        cfg.name = "a".repeat(51);
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn router_must_resolve_server() {
        let mut cfg = base("t", "n");
        cfg.routers.push(RouterConfig {
            server: "missing".into(),
            prefix: "/p".into(),
            sse_prefix: None,
            cors: CorsConfig::default(),
            auth: AuthMode::None,
        });
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn allowed_tools_must_exist() {
        let mut cfg = base("t", "n");
        cfg.servers.push(ServerConfig {
            name: "s".into(),
            description: None,
            allowed_tools: vec!["ghost".into()],
            config: HashMap::new(),
        });
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn prefix_uniqueness_trims_trailing_slash() {
        let mut a = base("t", "a");
        a.servers.push(ServerConfig {
            name: "s".into(),
            description: None,
            allowed_tools: vec![],
            config: HashMap::new(),
        });
        a.routers.push(RouterConfig {
            server: "s".into(),
            prefix: "/api/".into(),
            sse_prefix: None,
            cors: CorsConfig::default(),
            auth: AuthMode::None,
        });
        let mut b = base("t", "b");
        b.servers.push(ServerConfig {
            name: "s".into(),
            description: None,
            allowed_tools: vec![],
            config: HashMap::new(),
        });
        b.routers.push(RouterConfig {
            server: "s".into(),
            prefix: "/api".into(),
            sse_prefix: None,
            cors: CorsConfig::default(),
            auth: AuthMode::None,
        });
        let err = validate_all(&[a, b]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("t/a") && msg.contains("t/b"));
    }

    #[test]
    fn tombstone_merge_removes_exact_match() {
        let n1 = base("t", "n1");
        let n2 = base("t", "n2");
        let existing = vec![n1.clone(), n2.clone()];
        let mut tomb = base("t", "n2");
        tomb.deleted_at = 12345;
        let merged = merge_configs(&existing, tomb);
        assert_eq!(merged, vec![n1]);
    }

    #[test]
    fn merge_replace_preserves_order() {
        let a = base("t", "a");
        let b = base("t", "b");
        let c = base("t", "c");
        let existing = vec![a.clone(), b.clone(), c.clone()];
        let mut new_b = base("t", "b");
        new_b.updated_at = 99;
        let merged = merge_configs(&existing, new_b.clone());
        assert_eq!(merged, vec![a, new_b, c]);
    }
}
