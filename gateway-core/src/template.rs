//! A purpose-built template interpreter: dotted-path lookup into a
//! read-only JSON scope, plus string substitution. Design Notes §9 is
//! explicit that this replaces a general expression/template engine — the
//! tool templates in this system never need more than "look up a value and
//! stringify it into place."

use serde_json::Value;

/// The read-only rendering context: `Config`, `Args`, `Request.Headers`,
/// `Response.Body` (spec §4.5) are conventionally top-level keys, but the
/// interpreter itself is agnostic to the shape — it just walks whatever
/// JSON object it's given.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    root: Value,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            root: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.root {
            map.insert(key.to_string(), value);
        }
    }

    /// Resolves a dotted path like `Args.userId` or `Response.Body.items.0`.
    /// Numeric segments index into arrays. Missing segments resolve to
    /// `None` rather than erroring — a template referencing an absent value
    /// renders as an empty string, matching the "never need more" design.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for segment in path.split('.') {
            cur = match cur {
                Value::Object(map) => map.get(segment)?,
                Value::Array(arr) => {
                    let idx: usize = segment.parse().ok()?;
                    arr.get(idx)?
                }
                _ => return None,
            };
        }
        Some(cur)
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders `{{dotted.path}}` placeholders in `text` against `scope`.
/// Unrecognized/unresolvable placeholders render as an empty string.
pub fn render(scope: &Scope, text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = text[i..].find("}}") {
                let path = text[i + 2..i + end].trim();
                if !path.is_empty() {
                    let rendered = scope.lookup(path).map(stringify).unwrap_or_default();
                    out.push_str(&rendered);
                    i += end + 2;
                    continue;
                }
            }
        }
        // Fall through: copy one char literally (handles a lone `{` that
        // isn't a valid opener).
        let ch = text[i..].chars().next().unwrap_or('\u{0}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Replaces single-brace `{name}` path placeholders in an endpoint
/// template with the given path args. Distinct from `render` because
/// endpoint path interpolation (spec §4.5 step 2) is a separate,
/// single-brace syntax from the double-brace scope lookups used
/// everywhere else.
pub fn render_path_placeholders(
    endpoint: &str,
    path_args: &std::collections::HashMap<String, String>,
) -> String {
    let mut out = String::with_capacity(endpoint.len());
    let bytes = endpoint.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = endpoint[i..].find('}') {
                let name = endpoint[i + 1..i + end].trim();
                if let Some(value) = path_args.get(name) {
                    out.push_str(value);
                    i += end + 1;
                    continue;
                }
            }
        }
        let ch = endpoint[i..].chars().next().unwrap_or('\u{0}');
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_path_lookup() {
        let mut scope = Scope::new();
        scope.set("Args", json!({"userId": "42"}));
        assert_eq!(render(&scope, "id={{Args.userId}}"), "id=42");
    }

    #[test]
    fn missing_path_renders_empty() {
        let scope = Scope::new();
        assert_eq!(render(&scope, "x={{Missing.path}}y"), "x=y");
    }

    #[test]
    fn nested_array_index() {
        let mut scope = Scope::new();
        scope.set("Response", json!({"Body": {"items": ["a", "b"]}}));
        assert_eq!(render(&scope, "{{Response.Body.items.1}}"), "b");
    }

    #[test]
    fn path_placeholder_substitution() {
        let mut args = std::collections::HashMap::new();
        args.insert("id".to_string(), "7".to_string());
        assert_eq!(
            render_path_placeholders("/users/{id}/profile", &args),
            "/users/7/profile"
        );
    }

    #[test]
    fn non_string_value_stringifies() {
        let mut scope = Scope::new();
        scope.set("Args", json!({"count": 3}));
        assert_eq!(render(&scope, "{{Args.count}}"), "3");
    }
}
