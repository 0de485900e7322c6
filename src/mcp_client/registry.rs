//! Connection registry: owns every server's status and live connection.
//!
//! Holds at most one [`ConnectionHandle`] per server id and drives the
//! status machine in [`super::status`].
//!
//! Locking:
//! - A global map lock guards membership only and is never held across I/O.
//! - Each entry has an async operation lock serialising `start`/`stop`/
//!   `toggle`/`remove` for that id. Different ids never contend.
//! - Each entry's state sits behind a short-lived sync lock shared with the
//!   disconnect watcher.
//!
//! A `stop` issued while a `start` is connecting waits for the start to
//! settle and then tears the new connection down: the last operation issued
//! determines the final state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use super::errors::McpError;
use super::lifecycle::ConnectionHandle;
use super::status::{ServerStatus, StatusEvent};
use super::transport::DEFAULT_HTTP_TIMEOUT;
use super::types::{tool_names, McpMethod, ServerDescriptor};

// ─── Snapshot ────────────────────────────────────────────────────────────────

/// Point-in-time view of one server, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerSnapshot {
    pub id: String,
    pub name: String,
    pub url: String,
    pub status: ServerStatus,
    pub active_connections: u32,
    pub start_time: Option<DateTime<Utc>>,
    /// How long the server took to answer its most recent call.
    pub last_response_time: Option<Duration>,
    pub last_error: Option<String>,
    /// Tools reported by the server if refreshed, else the declared list.
    pub tools: Vec<String>,
}

// ─── Entries ─────────────────────────────────────────────────────────────────

struct EntryState {
    descriptor: ServerDescriptor,
    status: ServerStatus,
    handle: Option<Arc<ConnectionHandle>>,
    last_error: Option<String>,
    /// Bumped on every start so stale watchers can tell they are stale.
    generation: u64,
    discovered_tools: Option<Vec<String>>,
    removed: bool,
}

impl EntryState {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            status: ServerStatus::Stopped,
            handle: None,
            last_error: None,
            generation: 0,
            discovered_tools: None,
            removed: false,
        }
    }

    fn apply(&mut self, event: StatusEvent) {
        match self.status.apply(event) {
            Ok(next) => {
                tracing::debug!(
                    server = %self.descriptor.id,
                    from = %self.status,
                    to = %next,
                    "status transition"
                );
                self.status = next;
            }
            Err(e) => {
                tracing::warn!(server = %self.descriptor.id, error = %e, "ignoring status event");
            }
        }
    }

    fn snapshot(&self) -> ServerSnapshot {
        let handle = self.handle.as_deref();
        ServerSnapshot {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            url: self.descriptor.url.clone(),
            status: self.status,
            active_connections: u32::from(self.status == ServerStatus::Running),
            start_time: handle.map(|h| h.start_time),
            last_response_time: handle.and_then(|h| h.last_response_time()),
            last_error: self.last_error.clone(),
            tools: self
                .discovered_tools
                .clone()
                .unwrap_or_else(|| self.descriptor.tools.clone()),
        }
    }
}

struct ServerEntry {
    op_lock: AsyncMutex<()>,
    state: StdMutex<EntryState>,
}

impl ServerEntry {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            op_lock: AsyncMutex::new(()),
            state: StdMutex::new(EntryState::new(descriptor)),
        }
    }

    fn state(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, Arc<ServerEntry>>,
    /// Registration order, for stable snapshots.
    order: Vec<String>,
}

// ─── ConnectionRegistry ──────────────────────────────────────────────────────

/// Registry of known servers and their live connections.
pub struct ConnectionRegistry {
    entries: StdMutex<Entries>,
    http_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HTTP_TIMEOUT)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry. `http_timeout` bounds HTTP connection setup
    /// and the liveness check; each call carries its own timeout.
    pub fn new(http_timeout: Duration) -> Self {
        Self {
            entries: StdMutex::new(Entries::default()),
            http_timeout,
        }
    }

    /// Create a registry holding `descriptors`, all stopped.
    ///
    /// Each descriptor is registered on its own. Invalid or duplicate ones
    /// are logged and skipped; their errors are returned alongside.
    pub fn from_descriptors(
        descriptors: Vec<ServerDescriptor>,
        http_timeout: Duration,
    ) -> (Self, Vec<McpError>) {
        let registry = Self::new(http_timeout);
        let mut rejected = Vec::new();
        for descriptor in descriptors {
            let id = descriptor.id.clone();
            if let Err(e) = registry.add(descriptor) {
                tracing::warn!(server = %id, error = %e, "skipping server descriptor");
                rejected.push(e);
            }
        }
        (registry, rejected)
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry(&self, id: &str) -> Result<Arc<ServerEntry>, McpError> {
        self.entries()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer { id: id.to_string() })
    }

    // ─── Membership ──────────────────────────────────────────────────────

    /// Register a new server in the stopped state.
    pub fn add(&self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        descriptor.validate()?;

        let mut entries = self.entries();
        if entries.by_id.contains_key(&descriptor.id) {
            return Err(McpError::DuplicateServer { id: descriptor.id });
        }
        let id = descriptor.id.clone();
        entries
            .by_id
            .insert(id.clone(), Arc::new(ServerEntry::new(descriptor)));
        entries.order.push(id.clone());
        drop(entries);

        tracing::info!(server = %id, "server registered");
        Ok(())
    }

    /// Unregister a server, tearing down its connection first.
    pub async fn remove(&self, id: &str) -> Result<ServerDescriptor, McpError> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;

        if entry.state().removed {
            return Err(McpError::UnknownServer { id: id.to_string() });
        }
        self.stop_locked(&entry).await;

        let descriptor = {
            let mut state = entry.state();
            state.removed = true;
            state.descriptor.clone()
        };
        {
            let mut entries = self.entries();
            entries.by_id.remove(id);
            entries.order.retain(|known| known != id);
        }

        tracing::info!(server = %id, "server removed");
        Ok(descriptor)
    }

    /// Replace a server's metadata. Takes effect on the next start.
    pub fn update(&self, descriptor: ServerDescriptor) -> Result<(), McpError> {
        descriptor.validate()?;
        let entry = self.entry(&descriptor.id)?;
        let mut state = entry.state();
        if state.descriptor.url != descriptor.url && state.status.is_active() {
            tracing::info!(server = %descriptor.id, "url changed; restart to apply");
        }
        state.descriptor = descriptor;
        Ok(())
    }

    pub fn descriptor(&self, id: &str) -> Option<ServerDescriptor> {
        let entry = self.entry(id).ok()?;
        let descriptor = entry.state().descriptor.clone();
        Some(descriptor)
    }

    /// All descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.ordered_entries()
            .iter()
            .map(|entry| entry.state().descriptor.clone())
            .collect()
    }

    pub fn status(&self, id: &str) -> Result<ServerStatus, McpError> {
        let entry = self.entry(id)?;
        let status = entry.state().status;
        Ok(status)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.entries().order.clone()
    }

    pub fn len(&self) -> usize {
        self.entries().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ordered_entries(&self) -> Vec<Arc<ServerEntry>> {
        let entries = self.entries();
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect to a stopped or failed server.
    ///
    /// A failed attempt leaves the server in `error` and returns the
    /// connection error; the server may be started again.
    pub async fn start(&self, id: &str) -> Result<(), McpError> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;
        self.start_locked(&entry).await
    }

    /// Disconnect a running server. A no-op when nothing is connected.
    pub async fn stop(&self, id: &str) -> Result<(), McpError> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;
        if entry.state().removed {
            return Err(McpError::UnknownServer { id: id.to_string() });
        }
        self.stop_locked(&entry).await;
        Ok(())
    }

    /// Stop if running, otherwise start. Returns the resulting status.
    pub async fn toggle(&self, id: &str) -> Result<ServerStatus, McpError> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;

        let status = entry.state().status;
        if status == ServerStatus::Running {
            self.stop_locked(&entry).await;
        } else {
            self.start_locked(&entry).await?;
        }
        let status = entry.state().status;
        Ok(status)
    }

    /// Stop every running server. Failures are logged and skipped.
    /// Returns the number of servers stopped.
    pub async fn disconnect_all(&self) -> usize {
        let running: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|snap| snap.status.is_active())
            .map(|snap| snap.id)
            .collect();

        let results = futures::future::join_all(running.iter().map(|id| self.stop(id))).await;

        let mut stopped = 0;
        for (id, result) in running.iter().zip(results) {
            match result {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!(server = %id, error = %e, "failed to stop server"),
            }
        }
        tracing::info!(stopped, "disconnected all servers");
        stopped
    }

    async fn start_locked(&self, entry: &Arc<ServerEntry>) -> Result<(), McpError> {
        let (descriptor, generation) = {
            let mut state = entry.state();
            if state.removed {
                return Err(McpError::UnknownServer {
                    id: state.descriptor.id.clone(),
                });
            }
            if !state.status.can_start() {
                return Err(McpError::AlreadyRunning {
                    id: state.descriptor.id.clone(),
                });
            }
            state.apply(StatusEvent::Start);
            state.generation += 1;
            state.last_error = None;
            (state.descriptor.clone(), state.generation)
        };

        tracing::info!(server = %descriptor.id, url = %descriptor.url, "starting server");

        match ConnectionHandle::establish(&descriptor, self.http_timeout).await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                {
                    let mut state = entry.state();
                    state.apply(StatusEvent::ConnectSucceeded);
                    state.handle = Some(handle.clone());
                    state.discovered_tools = None;
                }
                spawn_disconnect_watcher(entry.clone(), &handle, generation);
                tracing::info!(
                    server = %descriptor.id,
                    connection_id = %handle.connection_id,
                    "server running"
                );
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = entry.state();
                    state.apply(StatusEvent::ConnectFailed);
                    state.last_error = Some(e.to_string());
                }
                tracing::warn!(server = %descriptor.id, error = %e, "failed to start server");
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, entry: &Arc<ServerEntry>) {
        let handle = {
            let mut state = entry.state();
            if state.status != ServerStatus::Running {
                return;
            }
            state.apply(StatusEvent::Stop);
            state.discovered_tools = None;
            state.handle.take()
        };

        if let Some(handle) = handle {
            handle.shutdown().await;
            tracing::info!(server = %handle.server_id, "server stopped");
        }
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Send a request to a running server.
    ///
    /// Any answer, error objects included, updates the server's
    /// `last_response_time`.
    pub async fn call(
        &self,
        id: &str,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let handle = self.live_handle(id)?;
        let started = Instant::now();
        let result = handle.client().call(method, params, timeout).await;
        if matches!(result, Ok(_) | Err(McpError::Remote { .. })) {
            handle.record_response(started.elapsed());
        }
        result
    }

    /// Ask a running server for its tools and remember them for snapshots.
    pub async fn refresh_tools(&self, id: &str, timeout: Duration) -> Result<Vec<String>, McpError> {
        let handle = self.live_handle(id)?;
        let result = self
            .call(id, McpMethod::ListTools.as_str(), None, timeout)
            .await?;
        let names = tool_names(&result);

        let entry = self.entry(id)?;
        let mut state = entry.state();
        let same_connection = state
            .handle
            .as_ref()
            .is_some_and(|current| current.connection_id == handle.connection_id);
        if same_connection {
            state.discovered_tools = Some(names.clone());
        }
        Ok(names)
    }

    fn live_handle(&self, id: &str) -> Result<Arc<ConnectionHandle>, McpError> {
        let entry = self.entry(id)?;
        let state = entry.state();
        match (&state.handle, state.status) {
            (Some(handle), ServerStatus::Running) => Ok(handle.clone()),
            _ => Err(McpError::NotRunning { id: id.to_string() }),
        }
    }

    // ─── Snapshot ────────────────────────────────────────────────────────

    /// Current view of every server, in registration order.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        self.ordered_entries()
            .iter()
            .map(|entry| entry.state().snapshot())
            .collect()
    }

    /// Current view of one server.
    pub fn server_snapshot(&self, id: &str) -> Result<ServerSnapshot, McpError> {
        let entry = self.entry(id)?;
        let snapshot = entry.state().snapshot();
        Ok(snapshot)
    }
}

/// Move the entry from `running` to `stopped` when the connection ends on
/// its own. Does nothing if the entry has since been stopped or restarted.
fn spawn_disconnect_watcher(entry: Arc<ServerEntry>, handle: &ConnectionHandle, generation: u64) {
    let mut connected = handle.subscribe_connected();
    tokio::spawn(async move {
        // An error means the client is gone, which also ends the connection.
        let _ = connected.wait_for(|is_connected| !*is_connected).await;

        let stale_handle = {
            let mut state = entry.state();
            if state.generation != generation || state.status != ServerStatus::Running {
                return;
            }
            state.apply(StatusEvent::Disconnected);
            state.last_error = Some("connection lost".into());
            state.discovered_tools = None;
            state.handle.take()
        };

        if let Some(handle) = stale_handle {
            tracing::warn!(
                server = %handle.server_id,
                connection_id = %handle.connection_id,
                "server disconnected"
            );
            handle.shutdown().await;
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────────────────
