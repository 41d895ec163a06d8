use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Fixed per-entry overhead used when estimating the in-memory size of a result.
const ENTRY_OVERHEAD_BYTES: usize = 200;

/// A request to run a named tool.
///
/// `server_name` may be empty, in which case routing is left entirely to the
/// load balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolExecution {
    pub tool_name: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl ToolExecution {
    pub fn new(tool_name: impl Into<String>, server_name: impl Into<String>) -> Self {
        ToolExecution {
            tool_name: tool_name.into(),
            server_name: server_name.into(),
            arguments: Map::new(),
        }
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.into(), value.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Map<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }
}

/// One item of tool output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        ToolContent {
            content_type: "text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn data(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ToolContent {
            content_type: "data".to_string(),
            data: Some(data.into()),
            mime_type: Some(mime_type.into()),
            ..Default::default()
        }
    }
}

/// The outcome of a tool call.
///
/// A result with `success == false` is a tool-level failure reported by the
/// server. It is a value, not an error, and is never cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub tool_name: String,
    pub server_name: String,
    pub success: bool,
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(
        tool_name: impl Into<String>,
        server_name: impl Into<String>,
        content: Vec<ToolContent>,
        duration: Duration,
    ) -> Self {
        ToolResult {
            tool_name: tool_name.into(),
            server_name: server_name.into(),
            success: true,
            content,
            error: None,
            duration,
        }
    }

    pub fn failure(
        tool_name: impl Into<String>,
        server_name: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        ToolResult {
            tool_name: tool_name.into(),
            server_name: server_name.into(),
            success: false,
            content: Vec::new(),
            error: Some(error.into()),
            duration,
        }
    }

    /// Rough number of bytes this result occupies when stored under `key`.
    pub fn estimated_size(&self, key: &str) -> usize {
        let content: usize = self
            .content
            .iter()
            .map(|c| {
                c.text.as_deref().map_or(0, str::len) + c.data.as_deref().map_or(0, str::len)
            })
            .sum();
        key.len() + content + ENTRY_OVERHEAD_BYTES
    }
}
