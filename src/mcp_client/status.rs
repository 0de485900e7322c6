//! Per-server status state machine.
//!
//! ```text
//! stopped --start--> connecting --connected--> running --stop/disconnect--> stopped
//!                         \--connect failed--> error --start--> connecting
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No connection is held. Initial state.
    #[default]
    Stopped,
    /// A connection attempt is in flight.
    Connecting,
    /// A live connection is held.
    Running,
    /// The last connection attempt failed. No connection is held.
    Error,
}

/// Something that happened to a server, driving its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    Start,
    ConnectSucceeded,
    ConnectFailed,
    Stop,
    Disconnected,
}

/// An event that is not allowed in the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply {event:?} while {from}")]
pub struct InvalidTransition {
    pub from: ServerStatus,
    pub event: StatusEvent,
}

impl ServerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    /// Whether a connection is held or being established.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Running)
    }

    /// Whether `start` is allowed from here.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Apply an event, returning the next status.
    pub fn apply(self, event: StatusEvent) -> Result<Self, InvalidTransition> {
        use ServerStatus::*;
        use StatusEvent::*;

        match (self, event) {
            (Stopped | Error, Start) => Ok(Connecting),
            (Connecting, ConnectSucceeded) => Ok(Running),
            (Connecting, ConnectFailed) => Ok(Error),
            (Running, Stop | Disconnected) => Ok(Stopped),
            // Stopping something that holds no connection changes nothing.
            (Stopped | Error, Stop) => Ok(self),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ServerStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopped" => Ok(ServerStatus::Stopped),
            "connecting" => Ok(ServerStatus::Connecting),
            "running" => Ok(ServerStatus::Running),
            "error" => Ok(ServerStatus::Error),
            _ => Err(format!("unknown server status: {value}")),
        }
    }
}
