//! MCP client error types.
//!
//! Every error is scoped to the server it originated from. Structured logging
//! is the caller's responsibility; the variants carry the context needed to
//! build meaningful log entries.

use std::fmt;

use thiserror::Error;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// The server executable could not be launched.
    SpawnFailed,
    /// `connect` was called on a client that is already connected.
    AlreadyConnected,
    /// An HTTP endpoint did not answer the liveness probe.
    Unreachable,
    /// The descriptor URL could not be turned into an endpoint.
    InvalidUrl,
}

impl ConnectFailure {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpawnFailed => "spawn_failed",
            Self::AlreadyConnected => "already_connected",
            Self::Unreachable => "unreachable",
            Self::InvalidUrl => "invalid_url",
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during MCP client and registry operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Establishing the connection failed.
    #[error("connection to server '{server}' failed ({reason}): {detail}")]
    Connection {
        server: String,
        reason: ConnectFailure,
        detail: String,
    },

    /// Read or write failure on an established connection.
    #[error("I/O error on server '{server}': {reason}")]
    Io {
        server: String,
        reason: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("protocol error on server '{server}': {reason}")]
    Protocol {
        server: String,
        reason: String,
    },

    /// No response arrived before the per-call deadline.
    #[error("call '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The connection closed while the call was outstanding.
    #[error("server '{server}' disconnected")]
    Disconnected {
        server: String,
    },

    /// The remote server answered with an error object.
    #[error("remote error [{code}]: {message}")]
    Remote {
        code: i64,
        message: String,
    },

    /// No server with this id is registered.
    #[error("unknown server: '{id}'")]
    UnknownServer {
        id: String,
    },

    /// The server is already connecting or running.
    #[error("server '{id}' is already running")]
    AlreadyRunning {
        id: String,
    },

    /// The server is not running, so it cannot serve calls.
    #[error("server '{id}' is not running")]
    NotRunning {
        id: String,
    },

    /// A descriptor failed validation.
    #[error("invalid descriptor '{id}': {reason}")]
    InvalidDescriptor {
        id: String,
        reason: String,
    },

    /// A descriptor with the same id is already registered.
    #[error("server '{id}' is already registered")]
    DuplicateServer {
        id: String,
    },

    /// Configuration file could not be read, parsed or written.
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// Faults of the connection itself, after which the server is unusable.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            McpError::Connection { .. } | McpError::Io { .. } | McpError::Disconnected { .. }
        )
    }

    /// Errors caused by what the caller asked for rather than by a server.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            McpError::UnknownServer { .. }
                | McpError::AlreadyRunning { .. }
                | McpError::NotRunning { .. }
                | McpError::InvalidDescriptor { .. }
                | McpError::DuplicateServer { .. }
        )
    }

    /// The connect failure reason, if this is a connection error.
    pub fn connect_failure(&self) -> Option<ConnectFailure> {
        match self {
            McpError::Connection { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
