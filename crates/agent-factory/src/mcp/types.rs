//! Shared types for tool servers, tools and per-call context.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property name that is never exposed to models in a tool's input schema.
pub const ACCESS_TOKEN_PARAM: &str = "access_token";

/// Per-invocation data that travels from the caller down to tool servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Caller's bearer token, forwarded to servers with `token_source: forwarded`.
    pub access_token: Option<String>,
}

impl CallContext {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
        }
    }
}

/// Tool as reported by a server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Tool as exposed to models: namespaced and with a sanitized schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub server: String,
    /// Name on the server.
    pub name: String,
    /// Name the model sees, `<server>-<tool>`.
    pub exposed_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDescriptor {
    pub fn from_remote(server: &str, tool: RemoteTool) -> Self {
        Self {
            server: server.to_string(),
            exposed_name: exposed_tool_name(server, &tool.name),
            name: tool.name,
            description: tool.description,
            input_schema: strip_access_token(tool.input_schema),
        }
    }
}

pub fn exposed_tool_name(server: &str, tool: &str) -> String {
    format!("{server}-{tool}")
}

/// Remove the `access_token` property (and its `required` entry) from a
/// tool input schema. Tokens travel in headers, never as arguments.
pub fn strip_access_token(mut schema: Value) -> Value {
    if let Some(obj) = schema.as_object_mut() {
        if let Some(props) = obj.get_mut("properties").and_then(Value::as_object_mut) {
            props.remove(ACCESS_TOKEN_PARAM);
        }
        if let Some(req) = obj.get_mut("required").and_then(Value::as_array_mut) {
            req.retain(|v| v.as_str() != Some(ACCESS_TOKEN_PARAM));
        }
    }
    schema
}

/// Flattened result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallOutcome {
    /// Text content blocks joined by newlines; other blocks as JSON.
    pub text: String,
    pub is_error: bool,
}

impl ToolCallOutcome {
    /// Build from a raw `CallToolResult` JSON object.
    pub fn from_result(result: &Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let text = match result.get("content").and_then(Value::as_array) {
            Some(blocks) => blocks
                .iter()
                .map(|b| match (b.get("type").and_then(Value::as_str), b.get("text")) {
                    (Some("text"), Some(Value::String(t))) => t.clone(),
                    _ => b.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => match result.get("structuredContent") {
                Some(v) => v.to_string(),
                None => String::new(),
            },
        };
        Self { text, is_error }
    }
}

/// Reachability of one configured server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerHealth {
    /// Connected and the last check (if any) succeeded.
    Healthy,
    /// Connected, but the last health check failed or timed out.
    Unhealthy { reason: String },
    /// Never connected.
    Unavailable { reason: String },
}

impl ServerHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ServerHealth::Healthy)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServerHealth::Healthy => "healthy",
            ServerHealth::Unhealthy { .. } => "unhealthy",
            ServerHealth::Unavailable { .. } => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: method.to_string(),
            params,
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
