//! Correlating MCP client runtime for servers hosted as child processes.
//!
//! Start with [`mcp_client::Session`] for one server, or
//! [`mcp_client::McpClient`] to address servers from a config file by name.

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{McpClient, McpError, Outcome, Session};
