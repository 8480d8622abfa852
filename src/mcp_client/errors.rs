//! MCP client error types.
//!
//! Every failure inside the runtime is an [`McpError`]. Callers never see one
//! directly: the session boundary folds them into an
//! [`Outcome`](super::outcome::Outcome) via [`McpError::kind`].

use thiserror::Error;

use super::outcome::FailureKind;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// The server process could not be located or launched.
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    /// The `initialize` exchange failed or returned something unusable.
    #[error("server '{server}' initialization failed: {reason}")]
    Handshake { server: String, reason: String },

    /// Pipe I/O failed while writing or reading a frame.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// No reply arrived before the call's deadline.
    #[error("'{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// The server process exited or its output pipe closed.
    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// A frame could not be decoded or did not have the expected shape.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The server returned a well-formed JSON-RPC error reply.
    #[error("server error [{code}]: {message}")]
    Application {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The session is not in a state that accepts this operation.
    #[error("session is not connected (state: {state})")]
    NotConnected { state: String },

    /// The call was withdrawn before a reply arrived.
    #[error("'{method}' was cancelled")]
    Cancelled { method: String },

    /// Configuration error (missing server, bad config file).
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl McpError {
    /// The caller-facing failure kind for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            McpError::Spawn { .. } => FailureKind::SpawnError,
            McpError::Handshake { .. } => FailureKind::HandshakeError,
            McpError::Transport { .. } => FailureKind::TransportError,
            McpError::Timeout { .. } => FailureKind::TimeoutError,
            McpError::ConnectionLost { .. } => FailureKind::ConnectionLost,
            McpError::Protocol { .. } => FailureKind::ProtocolError,
            McpError::Application { .. } => FailureKind::ApplicationError,
            McpError::NotConnected { .. } => FailureKind::NotConnected,
            McpError::Cancelled { .. } => FailureKind::Cancelled,
            McpError::Config { .. } => FailureKind::ConfigError,
        }
    }

    /// The message shown to users.
    ///
    /// Server-reported failures surface the server's own message verbatim;
    /// everything else uses the `Display` text.
    pub fn user_message(&self) -> String {
        match self {
            McpError::Application { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether this error means the connection is unusable from now on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            McpError::Spawn { .. } | McpError::Handshake { .. } | McpError::ConnectionLost { .. }
        )
    }

    pub(crate) fn transport(reason: impl Into<String>) -> Self {
        McpError::Transport {
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        McpError::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        McpError::ConnectionLost {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Protocol {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let cases = [
            (
                McpError::Spawn {
                    command: "nope".into(),
                    reason: "not found".into(),
                },
                FailureKind::SpawnError,
            ),
            (
                McpError::Timeout {
                    method: "tools/call".into(),
                    timeout_ms: 10,
                },
                FailureKind::TimeoutError,
            ),
            (McpError::connection_lost("eof"), FailureKind::ConnectionLost),
            (McpError::protocol("bad json"), FailureKind::ProtocolError),
            (
                McpError::Cancelled {
                    method: "ping".into(),
                },
                FailureKind::Cancelled,
            ),
        ];
        for (err, kind) in cases {
            assert_eq!(err.kind(), kind, "{err}");
        }
    }

    #[test]
    fn test_application_user_message_is_verbatim() {
        let err = McpError::Application {
            code: -32002,
            message: "not found".into(),
            data: None,
        };
        assert_eq!(err.user_message(), "not found");
        assert_eq!(err.to_string(), "server error [-32002]: not found");
    }

    #[test]
    fn test_timeout_display() {
        let err = McpError::Timeout {
            method: "resources/read".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.user_message(), "'resources/read' timed out after 250ms");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(McpError::connection_lost("eof").is_fatal());
        assert!(!McpError::transport("broken pipe").is_fatal());
    }

    #[test]
    fn test_from_serde_error_is_protocol() {
        let err: McpError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), FailureKind::ProtocolError);
    }
}
