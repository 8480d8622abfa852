//! One subprocess-backed MCP connection.
//!
//! A [`Session`] owns exactly one [`StdioTransport`] and one [`Correlator`].
//! It sequences the `initialize` handshake, enforces the state machine
//!
//! ```text
//! Unconnected → Starting → Handshaking → Ready → Closing → Closed
//!                    ╰────────────╰───────────╰──→ Errored
//! ```
//!
//! and exposes typed operations that always return an [`Outcome`].

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use super::catalog::CapabilityCatalog;
use super::config::{ClientOptions, ServerConfig};
use super::correlator::Correlator;
use super::errors::McpError;
use super::outcome::{normalize_resource_result, normalize_tool_result, Outcome, Payload, ResourceContent};
use super::transport::StdioTransport;
use super::types::{
    methods, Implementation, InitializeParams, InitializeResult, ListResourcesResult,
    ListToolsResult, ResourceDescriptor, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on pages followed for one listing.
const MAX_LIST_PAGES: usize = 64;

/// How long a failed handshake waits for the last stderr lines.
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Longest stderr excerpt attached to a handshake error.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconnected,
    Starting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    /// Absorbing: reached on spawn, handshake or transport failure.
    Errored,
}

impl SessionState {
    /// No further transitions except releasing resources.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }

    fn as_str(self) -> &'static str {
        match self {
            SessionState::Unconnected => "unconnected",
            SessionState::Starting => "starting",
            SessionState::Handshaking => "handshaking",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// Handle to one MCP server connection.
///
/// Cloning is cheap and every clone refers to the same connection. When the
/// last handle is dropped without `close`, the reader task is aborted and
/// the child is killed.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    name: String,
    config: ServerConfig,
    options: ClientOptions,
    state: Mutex<SessionState>,
    link: Mutex<Option<Link>>,
    catalog: RwLock<CapabilityCatalog>,
    server_info: Mutex<Option<InitializeResult>>,
}

/// Everything that exists only while a child is running.
struct Link {
    transport: Arc<StdioTransport>,
    correlator: Arc<Correlator>,
    reader: JoinHandle<()>,
}

impl Session {
    /// A session in `Unconnected`. Nothing is spawned until [`open`](Self::open).
    pub fn new(name: impl Into<String>, config: ServerConfig, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name: name.into(),
                config,
                options,
                state: Mutex::new(SessionState::Unconnected),
                link: Mutex::new(None),
                catalog: RwLock::new(CapabilityCatalog::new()),
                server_info: Mutex::new(None),
            }),
        }
    }

    /// Spawn the server and complete the handshake.
    pub async fn connect(
        name: impl Into<String>,
        config: ServerConfig,
        options: ClientOptions,
    ) -> Result<Self, McpError> {
        let session = Self::new(name, config, options);
        session.start().await?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// OS process id of the running child, if any.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.inner.link).as_ref().and_then(|link| link.transport.pid())
    }

    /// What the server reported during the handshake.
    pub fn server_info(&self) -> Option<InitializeResult> {
        lock(&self.inner.server_info).clone()
    }

    /// Snapshot of the last listed capabilities.
    pub fn catalog(&self) -> CapabilityCatalog {
        self.inner
            .catalog
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// `Unconnected → Starting → Handshaking → Ready`.
    ///
    /// Any failure leaves the session in `Errored` with the child stopped.
    pub async fn open(&self) -> Outcome<()> {
        self.start().await.into()
    }

    async fn start(&self) -> Result<(), McpError> {
        let inner = &self.inner;
        self.transition(&[SessionState::Unconnected], SessionState::Starting)?;

        let (transport, reader) = match StdioTransport::start(&inner.config) {
            Ok(started) => started,
            Err(e) => {
                tracing::error!(server = %inner.name, error = %e, "spawn failed");
                self.force_state(SessionState::Errored);
                return Err(e);
            }
        };

        let transport = Arc::new(transport);
        let correlator = Arc::new(Correlator::new(
            transport.clone(),
            inner.options.max_in_flight,
        ));

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let reader = correlator.spawn_reader(reader, move |err| {
            if let Some(inner) = weak.upgrade() {
                inner.mark_lost(err);
            }
        });

        *lock(&inner.link) = Some(Link {
            transport: transport.clone(),
            correlator: correlator.clone(),
            reader,
        });

        let handshake = match self.transition(&[SessionState::Starting], SessionState::Handshaking) {
            Ok(()) => self.handshake(&correlator).await,
            Err(e) => Err(e),
        };
        let init = match handshake {
            Ok(init) => init,
            Err(e) => return Err(self.fail_handshake(e, &transport).await),
        };

        if !init.tools.is_empty() {
            write_catalog(&inner.catalog).replace_tools(init.tools.clone());
        }
        *lock(&inner.server_info) = Some(init);

        if let Err(e) = self.transition(&[SessionState::Handshaking], SessionState::Ready) {
            self.release().await;
            return Err(e);
        }

        tracing::info!(server = %inner.name, pid = ?transport.pid(), "session ready");
        Ok(())
    }

    /// Stop the child and build the error `open` reports.
    async fn fail_handshake(&self, err: McpError, transport: &StdioTransport) -> McpError {
        let inner = &self.inner;
        if matches!(self.state(), SessionState::Closing | SessionState::Closed) {
            self.release().await;
            return McpError::Cancelled {
                method: methods::INITIALIZE.to_string(),
            };
        }

        self.force_state(SessionState::Errored);
        self.release().await;
        let stderr = transport.final_stderr(STDERR_SETTLE).await;
        let reason = format!("{}{}", handshake_reason(&err), format_stderr_suffix(&stderr));
        tracing::error!(server = %inner.name, reason = %reason, "handshake failed");
        McpError::Handshake {
            server: inner.name.clone(),
            reason,
        }
    }

    async fn handshake(&self, correlator: &Correlator) -> Result<InitializeResult, McpError> {
        let options = &self.inner.options;
        let params = InitializeParams {
            protocol_version: options.protocol_version.clone(),
            capabilities: json!({}),
            client_info: Implementation {
                name: options.client_name.clone(),
                version: options.client_version.clone(),
            },
        };

        let reply = correlator
            .dispatch(
                methods::INITIALIZE,
                Some(serde_json::to_value(params)?),
                options.init_timeout(),
            )
            .await?;

        if !reply.is_object() {
            return Err(McpError::protocol(format!(
                "initialize result is not an object: {reply}"
            )));
        }
        let init: InitializeResult = serde_json::from_value(reply)
            .map_err(|e| McpError::protocol(format!("failed to parse initialize result: {e}")))?;

        if let Some(ref version) = init.protocol_version {
            if *version != options.protocol_version {
                tracing::warn!(
                    server = %self.inner.name,
                    requested = %options.protocol_version,
                    negotiated = %version,
                    "server negotiated a different protocol version"
                );
            }
        }

        correlator.notify(methods::INITIALIZED, None).await?;
        Ok(init)
    }

    /// `→ Closing → Closed`, cancelling pending calls and stopping the child.
    ///
    /// Idempotent and safe from any state. An `Errored` session stays
    /// `Errored` but still releases its child.
    pub async fn close(&self) -> Outcome<()> {
        let prior = {
            let mut state = lock(&self.inner.state);
            match *state {
                SessionState::Closing | SessionState::Closed => return Outcome::Success(()),
                SessionState::Errored => SessionState::Errored,
                other => {
                    *state = SessionState::Closing;
                    other
                }
            }
        };
        tracing::debug!(server = %self.inner.name, from = %prior, "closing session");

        let link = lock(&self.inner.link).take();
        if let Some(ref link) = link {
            link.correlator.cancel_all();
        }
        if prior != SessionState::Errored {
            self.force_state(SessionState::Closed);
        }

        if let Some(link) = link {
            let code = link
                .transport
                .shutdown(self.inner.options.shutdown_grace())
                .await;
            link.reader.abort();
            tracing::info!(server = %self.inner.name, exit_code = ?code, "session closed");
        }
        Outcome::Success(())
    }

    /// Stop the child without touching the state.
    async fn release(&self) {
        let link = lock(&self.inner.link).take();
        if let Some(link) = link {
            link.correlator.cancel_all();
            link.transport
                .shutdown(self.inner.options.shutdown_grace())
                .await;
            link.reader.abort();
        }
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> Result<(), McpError> {
        let mut state = lock(&self.inner.state);
        if !from.contains(&*state) {
            return Err(McpError::NotConnected {
                state: state.to_string(),
            });
        }
        tracing::debug!(server = %self.inner.name, from = %*state, to = %to, "state transition");
        *state = to;
        Ok(())
    }

    fn force_state(&self, to: SessionState) {
        let mut state = lock(&self.inner.state);
        if *state != to {
            tracing::debug!(server = %self.inner.name, from = %*state, to = %to, "state transition");
            *state = to;
        }
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Raw request with the default timeout. Only valid in `Ready`.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.request_with_timeout(method, params, self.inner.options.request_timeout())
            .await
    }

    /// Raw request with an explicit timeout. Only valid in `Ready`.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let (correlator, transport) = self.ready_link()?;

        let result = correlator.dispatch(method, params, timeout).await;
        if let Err(McpError::Transport { ref reason }) = result {
            // A broken pipe to a dead child is a lost connection.
            if !transport.is_alive() {
                let lost = McpError::connection_lost(format!("server exited ({reason})"));
                self.inner.mark_lost(&lost);
                correlator.fail_all(reason);
                return Err(lost);
            }
        }
        result
    }

    fn ready_link(&self) -> Result<(Arc<Correlator>, Arc<StdioTransport>), McpError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(McpError::NotConnected {
                state: state.to_string(),
            });
        }
        lock(&self.inner.link)
            .as_ref()
            .map(|link| (link.correlator.clone(), link.transport.clone()))
            .ok_or(McpError::NotConnected {
                state: state.to_string(),
            })
    }

    /// Every tool the server offers, following pagination.
    pub async fn list_tools(&self) -> Outcome<Vec<ToolDescriptor>> {
        let result = self.list_all::<ListToolsResult>(methods::TOOLS_LIST).await;
        if let Ok(ref tools) = result {
            write_catalog(&self.inner.catalog).replace_tools(tools.clone());
        }
        result.into()
    }

    /// Every resource the server offers, following pagination.
    pub async fn list_resources(&self) -> Outcome<Vec<ResourceDescriptor>> {
        let result = self
            .list_all::<ListResourcesResult>(methods::RESOURCES_LIST)
            .await;
        if let Ok(ref resources) = result {
            write_catalog(&self.inner.catalog).replace_resources(resources.clone());
        }
        result.into()
    }

    async fn list_all<P: Page>(&self, method: &str) -> Result<Vec<P::Item>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let reply = self.request(method, params).await?;
            let page: P = serde_json::from_value(reply)
                .map_err(|e| McpError::protocol(format!("malformed {method} reply: {e}")))?;

            let (batch, next) = page.into_parts();
            items.extend(batch);
            match next.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }

        Err(McpError::protocol(format!(
            "{method} still paginating after {MAX_LIST_PAGES} pages"
        )))
    }

    /// Read one resource. Empty content is a successful, zero-length read.
    pub async fn read_resource(&self, uri: &str) -> Outcome<ResourceContent> {
        let result = async {
            let reply = self
                .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
                .await?;
            normalize_resource_result(uri, reply)
        }
        .await;
        result.into()
    }

    /// Invoke a tool. The reply is decoded once into a [`Payload`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Outcome<Payload> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let result = async {
            let reply = self
                .request(
                    methods::TOOLS_CALL,
                    Some(json!({ "name": name, "arguments": arguments })),
                )
                .await?;
            normalize_tool_result(reply)
        }
        .await;

        if let Err(ref e) = result {
            tracing::debug!(server = %self.inner.name, tool = name, error = %e, "tool call failed");
        }
        result.into()
    }

    /// Liveness probe at the protocol level.
    pub async fn ping(&self) -> Outcome<()> {
        self.request(methods::PING, None).await.map(|_| ()).into()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionInner {
    /// Reader saw EOF or an I/O error. Closing sessions are unaffected.
    fn mark_lost(&self, err: &McpError) {
        let mut state = lock(&self.state);
        if matches!(
            *state,
            SessionState::Closing | SessionState::Closed | SessionState::Errored
        ) {
            return;
        }
        tracing::warn!(server = %self.name, from = %*state, error = %err, "connection lost");
        *state = SessionState::Errored;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let link = self
            .link
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(link) = link {
            // The transport goes with the reader; kill_on_drop reaps the child.
            link.reader.abort();
            link.correlator.cancel_all();
        }
    }
}

// ─── Pagination ──────────────────────────────────────────────────────────────

/// One page of a cursor-paginated listing.
trait Page: DeserializeOwned {
    type Item;
    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

impl Page for ListToolsResult {
    type Item = ToolDescriptor;
    fn into_parts(self) -> (Vec<ToolDescriptor>, Option<String>) {
        (self.tools, self.next_cursor)
    }
}

impl Page for ListResourcesResult {
    type Item = ResourceDescriptor;
    fn into_parts(self) -> (Vec<ResourceDescriptor>, Option<String>) {
        (self.resources, self.next_cursor)
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_catalog(catalog: &RwLock<CapabilityCatalog>) -> std::sync::RwLockWriteGuard<'_, CapabilityCatalog> {
    catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn handshake_reason(err: &McpError) -> String {
    match err {
        McpError::Timeout { timeout_ms, .. } => {
            format!("no initialize reply within {timeout_ms}ms")
        }
        other => other.user_message(),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return String::new();
    }
    let excerpt: String = stderr.chars().take(STDERR_EXCERPT_CHARS).collect();
    if excerpt.len() < stderr.len() {
        format!(" | stderr: {excerpt}...(truncated)")
    } else {
        format!(" | stderr: {excerpt}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::outcome::FailureKind;

    fn options() -> ClientOptions {
        ClientOptions {
            init_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            shutdown_grace_ms: 500,
            ..ClientOptions::default()
        }
    }

    #[test]
    fn test_state_display_and_terminal() {
        assert_eq!(SessionState::Handshaking.to_string(), "handshaking");
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Errored.is_terminal());
        assert!(!SessionState::Ready.is_terminal());
    }

    #[test]
    fn test_stderr_suffix() {
        assert_eq!(format_stderr_suffix("  \n"), "");
        assert_eq!(format_stderr_suffix("boom\n"), " | stderr: boom");
        let long = "x".repeat(STDERR_EXCERPT_CHARS + 10);
        assert!(format_stderr_suffix(&long).ends_with("...(truncated)"));
    }

    #[tokio::test]
    async fn test_operations_before_open_are_not_connected() {
        let session = Session::new("idle", ServerConfig::new("true"), options());
        assert_eq!(session.state(), SessionState::Unconnected);

        let outcome = session.list_tools().await;
        assert_eq!(outcome.kind(), Some(FailureKind::NotConnected));
        let outcome = session.read_resource("x://a").await;
        assert_eq!(outcome.kind(), Some(FailureKind::NotConnected));
        let outcome = session.call_tool("echo", Value::Null).await;
        assert_eq!(outcome.kind(), Some(FailureKind::NotConnected));
        assert!(session.pid().is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal() {
        let session = Session::new(
            "ghost",
            ServerConfig::new("/definitely/not/a/real/binary"),
            options(),
        );

        let outcome = session.open().await;
        assert_eq!(outcome.kind(), Some(FailureKind::SpawnError));
        assert_eq!(session.state(), SessionState::Errored);

        // No implicit retry.
        let outcome = session.open().await;
        assert_eq!(outcome.kind(), Some(FailureKind::NotConnected));
        assert!(session.close().await.is_ok());
        assert_eq!(session.state(), SessionState::Errored);
    }

    #[tokio::test]
    async fn test_close_unconnected_twice() {
        let session = Session::new("idle", ServerConfig::new("true"), options());
        assert!(session.close().await.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close().await.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_failure_when_server_exits() {
        let config = ServerConfig::new("sh").with_args(["-c", "echo 'missing module' >&2; exit 3"]);
        let session = Session::new("broken", config, options());

        let outcome = session.open().await;
        assert_eq!(outcome.kind(), Some(FailureKind::HandshakeError));
        assert_eq!(session.state(), SessionState::Errored);
        assert!(session.pid().is_none());
    }
}
