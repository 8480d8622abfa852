//! Result normalization.
//!
//! Every caller-facing operation returns an [`Outcome`]. On the wire (and in
//! logs, HTTP bodies, CLI output) it serializes to one envelope shape:
//!
//! ```json
//! {"ok": true,  "payload": ...}
//! {"ok": false, "kind": "ApplicationError", "message": "not found"}
//! ```

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::errors::McpError;
use super::types::{CallToolResult, ReadResourceResult};

/// Failure taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SpawnError,
    HandshakeError,
    TransportError,
    TimeoutError,
    ConnectionLost,
    ProtocolError,
    ApplicationError,
    NotConnected,
    Cancelled,
    ConfigError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A typed failure with its user-visible message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<McpError> for Failure {
    fn from(e: McpError) -> Self {
        Failure {
            kind: e.kind(),
            message: e.user_message(),
        }
    }
}

/// Uniform success/failure wrapper returned by every session operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Success(T),
    Failure(Failure),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// The failure kind, if this is a failure.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(f) => Some(f.kind),
        }
    }

    pub fn payload(&self) -> Option<&T> {
        match self {
            Outcome::Success(p) => Some(p),
            Outcome::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }

    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Success(p) => Ok(p),
            Outcome::Failure(f) => Err(f),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(p) => Outcome::Success(f(p)),
            Outcome::Failure(e) => Outcome::Failure(e),
        }
    }
}

impl<T> From<Result<T, McpError>> for Outcome<T> {
    fn from(result: Result<T, McpError>) -> Self {
        match result {
            Ok(payload) => Outcome::Success(payload),
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a T>,
}

impl<T: Serialize> Serialize for Outcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let envelope = match self {
            Outcome::Success(payload) => Envelope {
                ok: true,
                kind: None,
                message: None,
                payload: Some(payload),
            },
            Outcome::Failure(f) => Envelope {
                ok: false,
                kind: Some(f.kind),
                message: Some(&f.message),
                payload: None,
            },
        };
        envelope.serialize(serializer)
    }
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// A tool reply, decided once: structured data or opaque text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Structured(Value),
    Opaque(String),
}

impl Payload {
    /// Decode text as JSON, falling back to the text itself.
    pub fn from_text(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) if !text.trim().is_empty() => Payload::Structured(value),
            _ => Payload::Opaque(text),
        }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            Payload::Structured(v) => Some(v),
            Payload::Opaque(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Structured(_) => None,
            Payload::Opaque(t) => Some(t),
        }
    }
}

/// Normalize a raw `tools/call` result.
///
/// `isError: true` is a server-reported failure. Anything that does not
/// parse as a `CallToolResult` is passed through as structured data rather
/// than reported as a decoding failure.
pub fn normalize_tool_result(result: Value) -> Result<Payload, McpError> {
    let parsed = match serde_json::from_value::<CallToolResult>(result.clone()) {
        Ok(parsed) if result.is_object() => parsed,
        _ => return Ok(Payload::Structured(result)),
    };

    let text = joined_text(&parsed);

    if parsed.is_error {
        return Err(McpError::Application {
            code: 0,
            message: text.unwrap_or_else(|| "tool reported an error".into()),
            data: parsed.structured_content,
        });
    }

    if let Some(structured) = parsed.structured_content {
        return Ok(Payload::Structured(structured));
    }

    match text {
        Some(text) => Ok(Payload::from_text(text)),
        None if parsed.content.is_empty() && result.get("content").is_none() => {
            Ok(Payload::Structured(result))
        }
        None => Ok(Payload::Opaque(String::new())),
    }
}

fn joined_text(result: &CallToolResult) -> Option<String> {
    let parts: Vec<&str> = result
        .content
        .iter()
        .filter_map(|item| item.text.as_deref())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Content of one resource read. Zero-length content is a valid success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
    pub content_length: usize,
}

impl ResourceContent {
    pub fn is_empty(&self) -> bool {
        self.content_length == 0
    }
}

/// Normalize a raw `resources/read` result for `requested_uri`.
pub fn normalize_resource_result(requested_uri: &str, result: Value) -> Result<ResourceContent, McpError> {
    let parsed: ReadResourceResult = serde_json::from_value(result)
        .map_err(|e| McpError::protocol(format!("malformed resources/read reply: {e}")))?;

    let Some(first) = parsed.contents.into_iter().next() else {
        return Ok(ResourceContent {
            uri: requested_uri.to_string(),
            mime_type: None,
            text: String::new(),
            blob: None,
            content_length: 0,
        });
    };

    let text = first.text.unwrap_or_default();
    let content_length = if text.is_empty() {
        first.blob.as_ref().map_or(0, String::len)
    } else {
        text.len()
    };

    Ok(ResourceContent {
        uri: first.uri.unwrap_or_else(|| requested_uri.to_string()),
        mime_type: first.mime_type,
        text,
        blob: first.blob,
        content_length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope() {
        let outcome: Outcome<Vec<String>> = Outcome::Success(vec![]);
        assert_eq!(serde_json::to_value(&outcome).unwrap(), json!({"ok": true, "payload": []}));
    }

    #[test]
    fn test_failure_envelope() {
        let outcome: Outcome<Value> = Err(McpError::Application {
            code: -32002,
            message: "not found".into(),
            data: None,
        })
        .into();
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"ok": false, "kind": "ApplicationError", "message": "not found"})
        );
        assert_eq!(outcome.kind(), Some(FailureKind::ApplicationError));
    }

    #[test]
    fn test_outcome_map_and_into_result() {
        let outcome: Outcome<u32> = Outcome::Success(2);
        assert_eq!(outcome.map(|n| n * 2).into_result(), Ok(4));

        let outcome: Outcome<u32> = Err(McpError::connection_lost("eof")).into();
        let failure = outcome.into_result().unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConnectionLost);
        assert_eq!(failure.message, "connection lost: eof");
    }

    #[test]
    fn test_payload_from_text() {
        assert_eq!(
            Payload::from_text(r#"{"status":"ok"}"#.into()),
            Payload::Structured(json!({"status": "ok"}))
        );
        assert_eq!(
            Payload::from_text("Terraform initialized".into()),
            Payload::Opaque("Terraform initialized".into())
        );
        assert_eq!(Payload::from_text(String::new()), Payload::Opaque(String::new()));
    }

    #[test]
    fn test_payload_serialization_is_tagged() {
        assert_eq!(
            serde_json::to_value(Payload::Opaque("hi".into())).unwrap(),
            json!({"opaque": "hi"})
        );
        assert_eq!(
            serde_json::to_value(Payload::Structured(json!([1]))).unwrap(),
            json!({"structured": [1]})
        );
    }

    #[test]
    fn test_tool_result_json_text() {
        let payload = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "{\"passed\": 12, \"failed\": 0}"}]
        }))
        .unwrap();
        assert_eq!(payload, Payload::Structured(json!({"passed": 12, "failed": 0})));
    }

    #[test]
    fn test_tool_result_plain_text() {
        let payload = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "Plan: 3 to add"}]
        }))
        .unwrap();
        assert_eq!(payload, Payload::Opaque("Plan: 3 to add".into()));
    }

    #[test]
    fn test_tool_result_structured_content_wins() {
        let payload = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "summary"}],
            "structuredContent": {"count": 3}
        }))
        .unwrap();
        assert_eq!(payload, Payload::Structured(json!({"count": 3})));
    }

    #[test]
    fn test_tool_result_is_error() {
        let err = normalize_tool_result(json!({
            "content": [{"type": "text", "text": "terraform not installed"}],
            "isError": true
        }))
        .unwrap_err();
        assert_eq!(err.kind(), FailureKind::ApplicationError);
        assert_eq!(err.user_message(), "terraform not installed");
    }

    #[test]
    fn test_tool_result_without_content_passes_through() {
        let payload = normalize_tool_result(json!({"diagram": "data:image/png;base64,AA=="})).unwrap();
        assert_eq!(payload.as_structured().unwrap()["diagram"], "data:image/png;base64,AA==");

        let payload = normalize_tool_result(json!("bare string")).unwrap();
        assert_eq!(payload, Payload::Structured(json!("bare string")));
    }

    #[test]
    fn test_tool_result_empty_content() {
        let payload = normalize_tool_result(json!({"content": []})).unwrap();
        assert_eq!(payload, Payload::Opaque(String::new()));
    }

    #[test]
    fn test_resource_result_text() {
        let content = normalize_resource_result(
            "terraform://aws_best_practices",
            json!({"contents": [{"uri": "terraform://aws_best_practices", "mimeType": "text/markdown", "text": "# AWS"}]}),
        )
        .unwrap();
        assert_eq!(content.text, "# AWS");
        assert_eq!(content.content_length, 5);
        assert_eq!(content.mime_type.as_deref(), Some("text/markdown"));
    }

    #[test]
    fn test_resource_result_empty_is_success() {
        let content = normalize_resource_result("x://empty", json!({"contents": []})).unwrap();
        assert!(content.is_empty());
        assert_eq!(content.uri, "x://empty");

        let content =
            normalize_resource_result("x://empty", json!({"contents": [{"uri": "x://empty", "text": ""}]})).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn test_resource_result_malformed() {
        let err = normalize_resource_result("x://y", json!({"contents": "nope"})).unwrap_err();
        assert_eq!(err.kind(), FailureKind::ProtocolError);
    }
}
