//! Connection lifecycle.
//!
//! A [`ConnectionHandle`] owns one connected [`McpClient`] plus the
//! bookkeeping the registry reports: when the connection started and how long
//! the server took to answer most recently. Dropping the handle releases the
//! connection.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use super::client::McpClient;
use super::errors::McpError;
use super::types::ServerDescriptor;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Upper bound on how long a graceful shutdown may take.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ConnectionHandle ────────────────────────────────────────────────────────

/// A live connection to one server.
pub struct ConnectionHandle {
    /// Unique per established connection; changes on every (re)start.
    pub connection_id: Uuid,
    pub server_id: String,
    pub start_time: DateTime<Utc>,
    client: Arc<McpClient>,
    /// Latency of the most recent answer, seeded when connecting.
    last_response_time: StdMutex<Option<Duration>>,
}

impl ConnectionHandle {
    /// Connect to the server described by `descriptor`.
    ///
    /// Stdio servers are spawned; HTTP servers must pass the liveness probe
    /// within `http_timeout`.
    pub async fn establish(
        descriptor: &ServerDescriptor,
        http_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut client = McpClient::new(descriptor)?;
        client.set_http_timeout(http_timeout);
        client.connect().await?;
        Ok(Self::from_client(&descriptor.id, Arc::new(client)))
    }

    /// Wrap an already-connected client.
    pub fn from_client(server_id: &str, client: Arc<McpClient>) -> Self {
        let handle = Self {
            connection_id: Uuid::new_v4(),
            server_id: server_id.to_string(),
            start_time: Utc::now(),
            last_response_time: StdMutex::new(client.connect_latency()),
            client,
        };
        tracing::debug!(
            server = %handle.server_id,
            connection_id = %handle.connection_id,
            "connection established"
        );
        handle
    }

    pub fn client(&self) -> &Arc<McpClient> {
        &self.client
    }

    pub fn is_alive(&self) -> bool {
        self.client.is_connected()
    }

    /// Flips to `false` when the connection ends for any reason.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.client.subscribe_connected()
    }

    pub fn last_response_time(&self) -> Option<Duration> {
        *self
            .last_response_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record how long the server took to answer a call.
    pub fn record_response(&self, elapsed: Duration) {
        *self
            .last_response_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(elapsed);
    }

    /// Time since the connection was established.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    /// Disconnect and release the transport.
    pub async fn shutdown(&self) {
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.client.disconnect())
            .await
            .is_err()
        {
            tracing::warn!(
                server = %self.server_id,
                connection_id = %self.connection_id,
                "shutdown timed out"
            );
            return;
        }
        tracing::debug!(
            server = %self.server_id,
            connection_id = %self.connection_id,
            uptime_ms = self.uptime().num_milliseconds(),
            "connection shut down"
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
