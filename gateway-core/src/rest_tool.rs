//! REST-Tool Executor (spec §4.5): resolves a tool call against a
//! `ToolConfig`, renders endpoint/headers/body through the template
//! interpreter, dials through an optional proxy, and decodes the response.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::{ArgConfig, ArgPosition, ArgType, ProxyConfig, ProxyScheme, ServerConfig, ToolConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::template::{self, Scope};

pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub content: String,
    pub is_error: bool,
}

pub struct RestToolExecutor {
    timeout: Duration,
}

impl Default for RestToolExecutor {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }
}

impl RestToolExecutor {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_client(&self, proxy: Option<&ProxyConfig>) -> GatewayResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        if let Some(p) = proxy {
            let url = proxy_url(p);
            let proxy = reqwest::Proxy::all(&url)
                .map_err(|e| GatewayError::Validation(format!("invalid proxy {url}: {e}")))?;
            builder = builder.proxy(proxy);
        }
        builder
            .build()
            .map_err(|e| GatewayError::Internal(format!("building http client: {e}")))
    }

    pub async fn execute(
        &self,
        tool: &ToolConfig,
        server: &ServerConfig,
        args: &Value,
        request_headers: &HashMap<String, String>,
    ) -> GatewayResult<ToolCallOutcome> {
        validate_args(tool, args)?;

        let mut scope = Scope::new();
        scope.set("Config", config_to_json(&server.config));
        scope.set("Args", args.clone());
        scope.set("Request", serde_json::json!({ "Headers": request_headers }));

        let rendered_endpoint = template::render(&scope, &tool.endpoint);
        let path_args = collect_args_by_position(tool, args, ArgPosition::Path);
        let endpoint = template::render_path_placeholders(&rendered_endpoint, &path_args);

        let query_args = collect_args_by_position(tool, args, ArgPosition::Query);
        let url = if query_args.is_empty() {
            endpoint
        } else {
            let qs: Vec<String> = query_args
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            let sep = if endpoint.contains('?') { "&" } else { "?" };
            format!("{endpoint}{sep}{}", qs.join("&"))
        };

        let mut header_map = reqwest::header::HeaderMap::new();
        let mut declared_auth = false;
        for (k, v) in &tool.headers {
            let rendered = template::render(&scope, v);
            if k.eq_ignore_ascii_case("authorization") {
                declared_auth = true;
            }
            insert_header(&mut header_map, k, &rendered)?;
        }
        if !declared_auth {
            if let Some(auth) = request_headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("authorization"))
                .map(|(_, v)| v.clone())
            {
                insert_header(&mut header_map, "Authorization", &auth)?;
            }
        }
        let header_args = collect_args_by_position(tool, args, ArgPosition::Header);
        for (k, v) in &header_args {
            insert_header(&mut header_map, k, v)?;
        }

        let body: Option<String> = match &tool.request_body {
            Some(t) if !t.is_empty() => Some(template::render(&scope, t)),
            _ => {
                let body_args = collect_body_args(tool, args);
                if body_args.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&Value::Object(body_args)).map_err(|e| {
                        GatewayError::Internal(format!("serializing body args: {e}"))
                    })?)
                }
            }
        };

        let client = self.build_client(tool.proxy.as_ref())?;
        let method = reqwest::Method::from_bytes(tool.method.as_bytes())
            .map_err(|_| GatewayError::Validation(format!("invalid method {}", tool.method)))?;
        let mut req = client.request(method, &url).headers(header_map);
        if let Some(b) = body {
            req = req.body(b);
        }

        let resp = req.send().await.map_err(|e| {
            GatewayError::UpstreamUnavailable(format!("calling tool {}: {e}", tool.name))
        })?;
        let status = resp.status();
        let body_text = resp.text().await.map_err(|e| {
            GatewayError::UpstreamProtocol(format!("reading response for {}: {e}", tool.name))
        })?;

        let response_body_value: Value =
            serde_json::from_str(&body_text).unwrap_or(Value::String(body_text.clone()));
        let mut resp_scope = scope;
        resp_scope.set("Response", serde_json::json!({ "Body": response_body_value }));

        let rendered = match &tool.response_body {
            Some(t) if !t.is_empty() => template::render(&resp_scope, t),
            _ => body_text,
        };

        Ok(ToolCallOutcome {
            content: rendered,
            is_error: !status.is_success(),
        })
    }
}

fn proxy_url(p: &ProxyConfig) -> String {
    let scheme = match p.scheme {
        ProxyScheme::Http => "http",
        ProxyScheme::Https => "https",
        ProxyScheme::Socks5 => "socks5",
    };
    format!("{scheme}://{}:{}", p.host, p.port)
}

fn insert_header(map: &mut reqwest::header::HeaderMap, name: &str, value: &str) -> GatewayResult<()> {
    let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| GatewayError::Validation(format!("invalid header name {name}: {e}")))?;
    let header_value = reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Validation(format!("invalid header value for {name}: {e}")))?;
    map.insert(header_name, header_value);
    Ok(())
}

fn config_to_json(config: &HashMap<String, String>) -> Value {
    Value::Object(
        config
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn arg_value<'a>(args: &'a Value, name: &str) -> Option<&'a Value> {
    args.as_object().and_then(|m| m.get(name))
}

fn stringify_arg(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn collect_args_by_position(
    tool: &ToolConfig,
    args: &Value,
    position: ArgPosition,
) -> HashMap<String, String> {
    tool.args
        .iter()
        .filter(|a| a.position == position)
        .filter_map(|a| {
            let v = arg_value(args, &a.name).or(a.default.as_ref())?;
            Some((a.name.clone(), stringify_arg(v)))
        })
        .collect()
}

fn collect_body_args(tool: &ToolConfig, args: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for a in tool.args.iter().filter(|a| a.position == ArgPosition::Body) {
        if let Some(v) = arg_value(args, &a.name).or(a.default.as_ref()) {
            out.insert(a.name.clone(), v.clone());
        }
    }
    out
}

/// Validates `args` against `inputSchema`-adjacent per-arg rules: presence
/// of required args, and a loose type check (spec §4.5 step 1 names the
/// six JSON-ish types; this checks shape, not deep schema conformance —
/// `inputSchema` itself is opaque JSON Schema the caller may validate more
/// strictly upstream).
pub fn validate_args(tool: &ToolConfig, args: &Value) -> GatewayResult<()> {
    for a in &tool.args {
        let value = arg_value(args, &a.name);
        match value {
            None if a.default.is_some() => {}
            None if a.required => {
                return Err(GatewayError::Validation(format!(
                    "missing required arg {}",
                    a.name
                )));
            }
            None => {}
            Some(v) => check_type(a, v)?,
        }
    }
    Ok(())
}

fn check_type(arg: &ArgConfig, v: &Value) -> GatewayResult<()> {
    let ok = match arg.arg_type {
        ArgType::String => v.is_string(),
        ArgType::Integer => v.is_i64() || v.is_u64(),
        ArgType::Number => v.is_number(),
        ArgType::Boolean => v.is_boolean(),
        ArgType::Array => v.is_array(),
        ArgType::Object => v.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(GatewayError::Validation(format!(
            "arg {} does not match declared type",
            arg.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool_with_args(args: Vec<ArgConfig>) -> ToolConfig {
        ToolConfig {
            name: "echo".into(),
            method: "GET".into(),
            endpoint: "https://example.test/{id}".into(),
            proxy: None,
            headers: HashMap::new(),
            args,
            request_body: None,
            response_body: None,
            input_schema: None,
        }
    }

    fn server() -> ServerConfig {
        ServerConfig {
            name: "s".into(),
            description: None,
            allowed_tools: vec![],
            config: HashMap::new(),
        }
    }

    #[test]
    fn required_arg_missing_is_rejected() {
        let tool = tool_with_args(vec![ArgConfig {
            name: "id".into(),
            position: ArgPosition::Path,
            arg_type: ArgType::String,
            required: true,
            default: None,
            items: None,
        }]);
        assert!(validate_args(&tool, &serde_json::json!({})).is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let tool = tool_with_args(vec![ArgConfig {
            name: "count".into(),
            position: ArgPosition::Query,
            arg_type: ArgType::Integer,
            required: true,
            default: None,
            items: None,
        }]);
        assert!(validate_args(&tool, &serde_json::json!({"count": "not a number"})).is_err());
    }

    #[test]
    fn path_args_interpolate_into_endpoint() {
        let tool = tool_with_args(vec![ArgConfig {
            name: "id".into(),
            position: ArgPosition::Path,
            arg_type: ArgType::String,
            required: true,
            default: None,
            items: None,
        }]);
        let mut scope_args = HashMap::new();
        scope_args.insert("id".to_string(), "42".to_string());
        let rendered = template::render_path_placeholders(&tool.endpoint, &scope_args);
        assert_eq!(rendered, "https://example.test/42");
    }

    #[test]
    fn server_config_carries_template_config_map() {
        let mut s = server();
        s.config.insert("base_url".into(), "https://api.test".into());
        assert_eq!(s.config.get("base_url").unwrap(), "https://api.test");
    }
}
