//! MCP Client: connections to MCP servers over stdio or HTTP.
//!
//! This module handles:
//! - Spawning server processes and wiring their stdio as a line transport
//! - Request/response correlation over newline-delimited JSON
//! - The per-server status machine and the one-connection-per-server registry
//! - Probing localhost for running servers
//!
//! The CLI drives everything through [`ConnectionRegistry`].

pub mod client;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod status;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_http;

// Re-exports for convenience
pub use client::{McpClient, DEFAULT_CALL_TIMEOUT};
pub use errors::{ConnectFailure, McpError};
pub use discovery::{check_configured, ServerHealth};
pub use lifecycle::ConnectionHandle;
pub use registry::{ConnectionRegistry, ServerSnapshot};
pub use status::{ServerStatus, StatusEvent};
pub use transport::{probe_url, Transport, DEFAULT_HTTP_TIMEOUT};
pub use types::{Endpoint, McpMethod, Request, Response, ServerDescriptor};
