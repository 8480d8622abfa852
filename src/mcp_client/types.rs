//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 frames as they travel over the pipe, and the MCP payload
//! structures carried inside them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::McpError;

/// Identifier of one request within a session.
pub type RequestId = u64;

/// MCP protocol revision declared in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const JSONRPC_VERSION: &str = "2.0";

/// Method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }

    /// Encode as one frame body (no trailing separator).
    pub fn encode(&self) -> Result<Vec<u8>, McpError> {
        serde_json::to_vec(self).map_err(|e| McpError::protocol(format!("failed to encode request: {e}")))
    }
}

/// JSON-RPC 2.0 notification (no id, no reply).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, McpError> {
        serde_json::to_vec(self)
            .map_err(|e| McpError::protocol(format!("failed to encode notification: {e}")))
    }
}

/// JSON-RPC 2.0 reply, as written by whichever side answers a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, McpError> {
        serde_json::to_vec(self).map_err(|e| McpError::protocol(format!("failed to encode reply: {e}")))
    }
}

/// JSON-RPC 2.0 error object.
///
/// `code` defaults to 0 because some servers send only a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(e: JsonRpcError) -> Self {
        McpError::Application {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

// ─── Inbound Frames ─────────────────────────────────────────────────────────

/// What a reply carried.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// `result` was present (possibly `null`).
    Result(Value),
    /// `error` was present.
    Error(JsonRpcError),
    /// Neither member was present.
    Empty,
}

/// One decoded frame read from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A reply to one of our requests.
    Reply { id: RequestId, body: ReplyBody },
    /// A request initiated by the server.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// A server notification.
    Notification { method: String, params: Option<Value> },
}

impl InboundFrame {
    /// Classify one frame.
    ///
    /// Fails with [`McpError::Protocol`] when the bytes are not a JSON object,
    /// or when a reply has no id we could have issued.
    pub fn decode(bytes: &[u8]) -> Result<Self, McpError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(mut obj) = value else {
            return Err(McpError::protocol("frame is not a JSON object"));
        };

        let id = obj.remove("id").filter(|v| !v.is_null());
        let params = obj.remove("params");

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let method = method.to_string();
            return Ok(match id {
                Some(id) => InboundFrame::Request { id, method, params },
                None => InboundFrame::Notification { method, params },
            });
        }

        let id = match id {
            Some(id) => parse_request_id(&id)
                .ok_or_else(|| McpError::protocol(format!("reply has foreign id {id}")))?,
            None => return Err(McpError::protocol("reply has no id")),
        };

        let body = match (obj.remove("error"), obj.remove("result")) {
            (Some(err), _) if !err.is_null() => ReplyBody::Error(decode_error_object(err)),
            (_, Some(result)) => ReplyBody::Result(result),
            _ => ReplyBody::Empty,
        };

        Ok(InboundFrame::Reply { id, body })
    }
}

/// Accept numeric ids and numeric strings; we only ever issue integers.
fn parse_request_id(id: &Value) -> Option<RequestId> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn decode_error_object(err: Value) -> JsonRpcError {
    match err {
        Value::String(message) => JsonRpcError::new(0, message),
        other => serde_json::from_value(other.clone())
            .unwrap_or_else(|_| JsonRpcError::new(0, other.to_string())),
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Name and version of one side of the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

/// Params of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Value,
    pub client_info: Implementation,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Tools advertised eagerly by servers that skip `tools/list`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One invocable tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// One readable resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Reply of `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Reply of `resources/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// One entry of a `resources/read` reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

/// Reply of `resources/read`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

/// One content block of a tool result.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentItem {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Reply of `tools/call`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Resource not found (MCP).
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
