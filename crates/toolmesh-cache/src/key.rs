use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use toolmesh_common::ToolExecution;

/// Number of hex characters of the argument digest kept in a key.
const HASH_LEN: usize = 16;

/// Identifies one cached tool result.
///
/// Two executions map to the same key when they target the same server and
/// tool and their arguments are equal after normalization, regardless of the
/// order in which the arguments were supplied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub server_name: String,
    pub tool_name: String,
    pub args_hash: String,
}

impl CacheKey {
    pub fn new(
        tool_name: impl Into<String>,
        server_name: impl Into<String>,
        arguments: &Map<String, Value>,
    ) -> Self {
        CacheKey {
            server_name: server_name.into(),
            tool_name: tool_name.into(),
            args_hash: hash_arguments(&normalize_arguments(arguments)),
        }
    }

    pub fn from_execution(execution: &ToolExecution) -> Self {
        Self::new(
            execution.tool_name.clone(),
            execution.server_name.clone(),
            &execution.arguments,
        )
    }

    /// The `server:tool` pair this key belongs to.
    pub fn cache_name(&self) -> String {
        format!("{}:{}", self.server_name, self.tool_name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.server_name, self.tool_name, self.args_hash)
    }
}

/// Lowercases and trims argument names, trims string values, and renders
/// everything else as compact JSON. The result is ordered by name.
pub fn normalize_arguments(arguments: &Map<String, Value>) -> BTreeMap<String, String> {
    arguments
        .iter()
        .map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            (name.trim().to_lowercase(), value)
        })
        .collect()
}

/// Hex SHA-256 prefix over `name=value|` pairs in name order.
pub fn hash_arguments(arguments: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in arguments {
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"|");
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_argument_order_does_not_matter() {
        let a = CacheKey::new("echo", "s1", &args(json!({"x": "1", "y": 2})));

        let mut reversed = Map::new();
        reversed.insert("y".into(), json!(2));
        reversed.insert("x".into(), json!("1"));
        let b = CacheKey::new("echo", "s1", &reversed);

        assert_eq!(a, b);
    }

    #[test]
    fn test_normalization() {
        let a = CacheKey::new("echo", "s1", &args(json!({" Query ": "  rust  "})));
        let b = CacheKey::new("echo", "s1", &args(json!({"query": "rust"})));
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_values_differ() {
        let a = CacheKey::new("echo", "s1", &args(json!({"x": "1"})));
        let b = CacheKey::new("echo", "s1", &args(json!({"x": "2"})));
        // arguments are compared by their string form
        let c = CacheKey::new("echo", "s1", &args(json!({"x": 1})));

        assert_ne!(a, b);
        assert_eq!(a.args_hash, c.args_hash);
    }

    #[test]
    fn test_display_format() {
        let key = CacheKey::new("echo", "s1", &Map::new());
        let rendered = key.to_string();

        assert!(rendered.starts_with("s1:echo:"));
        assert_eq!(key.args_hash.len(), 16);
        assert!(key.args_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key.cache_name(), "s1:echo");
    }
}
