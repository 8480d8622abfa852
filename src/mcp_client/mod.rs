//! MCP Client: JSON-RPC over stdio to one server process per session.
//!
//! This module handles:
//! - Spawning the server process and framing lines over its stdio
//! - Correlating concurrent requests with their replies by id
//! - The `initialize` handshake and the session state machine
//! - Normalizing every reply into a uniform [`Outcome`] envelope
//!
//! Layering, leaves first: [`transport`] → [`correlator`] → [`session`],
//! with [`outcome`] at the caller boundary and [`client`] as the
//! named-server entry point.

pub mod catalog;
pub mod client;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod outcome;
pub mod session;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use catalog::CapabilityCatalog;
pub use client::McpClient;
pub use config::{ClientOptions, McpServersConfig, ServerConfig};
pub use errors::McpError;
pub use outcome::{Failure, FailureKind, Outcome, Payload, ResourceContent};
pub use session::{Session, SessionState};
pub use types::{ResourceDescriptor, ToolDescriptor};
