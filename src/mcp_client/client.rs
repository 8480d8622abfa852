//! MCP Client: named-server facade over [`Session`].
//!
//! Holds the parsed configuration and opens one fresh session per request.
//! There is no shared connection: every `connect` spawns its own child, and
//! the caller owns the returned session.

use std::future::Future;
use std::path::Path;

use futures::future::join_all;

use super::config::{load_config, ClientOptions, McpServersConfig, ServerConfig};
use super::errors::McpError;
use super::outcome::{Failure, Outcome};
use super::session::Session;

/// Entry point for callers that address servers by name.
#[derive(Debug, Clone)]
pub struct McpClient {
    config: McpServersConfig,
}

impl McpClient {
    pub fn new(config: McpServersConfig) -> Self {
        Self { config }
    }

    /// Load a JSON or YAML config file.
    pub fn from_config_file(path: &Path) -> Result<Self, McpError> {
        Ok(Self::new(load_config(path)?))
    }

    /// Configured server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.config.server_names()
    }

    pub fn server_config(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.config.server(name)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.config.client
    }

    /// Set the per-call timeout in milliseconds.
    pub fn set_request_timeout(&mut self, timeout_ms: u64) {
        self.config.client.request_timeout_ms = timeout_ms;
    }

    /// An unopened session for `name`.
    pub fn session(&self, name: &str) -> Result<Session, McpError> {
        let config = self.config.server(name)?.clone();
        Ok(Session::new(name, config, self.config.client.clone()))
    }

    /// Spawn `name` and complete its handshake.
    pub async fn connect(&self, name: &str) -> Result<Session, McpError> {
        let config = self.config.server(name)?.clone();
        Session::connect(name, config, self.config.client.clone()).await
    }

    /// Connect every configured server concurrently.
    ///
    /// Partial success is fine: each name comes back with its own result.
    pub async fn connect_all(&self) -> Vec<(String, Result<Session, McpError>)> {
        let names = self.server_names();
        let sessions = join_all(names.iter().map(|name| self.connect(name))).await;

        let results: Vec<_> = names.into_iter().zip(sessions).collect();
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        tracing::info!(total = results.len(), failed, "connected configured servers");
        results
    }

    /// Connect, run `f`, and close, whatever `f` returns.
    pub async fn with_session<T, F, Fut>(&self, name: &str, f: F) -> Outcome<T>
    where
        F: FnOnce(Session) -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let session = match self.connect(name).await {
            Ok(session) => session,
            Err(e) => return Outcome::Failure(Failure::from(e)),
        };

        let outcome = f(session.clone()).await;
        session.close().await;
        outcome
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
