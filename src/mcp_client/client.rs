//! MCP protocol client: request/response correlation over a transport.
//!
//! Each request gets a fresh `req_<n>` id and a completion slot in the
//! pending table. A background read loop (one per connected stream client)
//! resolves slots by id, in whatever order responses arrive. When the stream
//! ends, every outstanding slot fails with `Disconnected`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::errors::{ConnectFailure, McpError};
use super::transport::{HttpTransport, StreamTransport, Transport, DEFAULT_HTTP_TIMEOUT};
use super::types::{decode_response, tool_names, Endpoint, McpMethod, Request, ServerDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `disconnect` waits for the read loop to wind down.
const READ_LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest malformed line echoed into the log.
const MAX_LOGGED_LINE: usize = 200;

type Reply = Result<Value, McpError>;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// A request awaiting its response.
struct PendingRequest {
    method: String,
    submitted_at: Instant,
    reply: oneshot::Sender<Reply>,
}

/// Outstanding requests keyed by id. Closed once the connection ends, after
/// which no new request can register.
#[derive(Default)]
struct PendingTable {
    open: bool,
    slots: HashMap<String, PendingRequest>,
}

/// State shared between the client handle and its read loop.
struct Shared {
    server_id: String,
    transport: OnceLock<Transport>,
    pending: StdMutex<PendingTable>,
    next_id: AtomicU64,
    connected: watch::Sender<bool>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_request_id(&self) -> String {
        format!("req_{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn disconnected(&self) -> McpError {
        McpError::Disconnected {
            server: self.server_id.clone(),
        }
    }

    fn register(&self, id: &str, method: &str, reply: oneshot::Sender<Reply>) -> Result<(), McpError> {
        let mut table = self.pending();
        if !table.open {
            return Err(self.disconnected());
        }
        table.slots.insert(
            id.to_string(),
            PendingRequest {
                method: method.to_string(),
                submitted_at: Instant::now(),
                reply,
            },
        );
        Ok(())
    }

    fn discard(&self, id: &str) {
        self.pending().slots.remove(id);
    }

    /// Route one incoming line to its pending request.
    fn dispatch(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let response = match decode_response(line) {
            Ok(response) => response,
            Err(e) => {
                let shown: String = line.chars().take(MAX_LOGGED_LINE).collect();
                tracing::warn!(
                    server = %self.server_id,
                    error = %e,
                    line = %shown,
                    "dropping malformed frame"
                );
                return;
            }
        };

        let slot = self.pending().slots.remove(&response.id);
        match slot {
            Some(slot) => {
                tracing::debug!(
                    server = %self.server_id,
                    request_id = %response.id,
                    method = %slot.method,
                    elapsed_ms = slot.submitted_at.elapsed().as_millis() as u64,
                    "response received"
                );
                // The caller may have timed out and gone away.
                let _ = slot.reply.send(response.into_result());
            }
            None => {
                tracing::debug!(
                    server = %self.server_id,
                    request_id = %response.id,
                    "dropping response with no pending request"
                );
            }
        }
    }

    /// Close the pending table and fail every outstanding request.
    fn shut_down(&self, reason: &str) {
        let drained: Vec<PendingRequest> = {
            let mut table = self.pending();
            if !table.open && table.slots.is_empty() {
                return;
            }
            table.open = false;
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        self.connected.send_replace(false);

        tracing::info!(
            server = %self.server_id,
            failed_requests = drained.len(),
            reason,
            "connection closed"
        );
        for slot in drained {
            let _ = slot.reply.send(Err(self.disconnected()));
        }
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Protocol client for one server connection.
///
/// `connect` may be called once. After the connection ends the client stays
/// disconnected; create a new client to reconnect.
pub struct McpClient {
    shared: Arc<Shared>,
    endpoint: Option<Endpoint>,
    preopened: StdMutex<Option<Transport>>,
    http_timeout: Duration,
    connect_attempted: AtomicBool,
    read_task: StdMutex<Option<JoinHandle<()>>>,
}

impl McpClient {
    /// Create a client for a descriptor. Fails if the URL is unusable.
    pub fn new(descriptor: &ServerDescriptor) -> Result<Self, McpError> {
        let endpoint = descriptor.endpoint()?;
        Ok(Self::build(&descriptor.id, Some(endpoint), None))
    }

    /// Create a client over an already-open transport.
    pub fn from_transport(server_id: &str, transport: Transport) -> Self {
        Self::build(server_id, None, Some(transport))
    }

    fn build(server_id: &str, endpoint: Option<Endpoint>, preopened: Option<Transport>) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                server_id: server_id.to_string(),
                transport: OnceLock::new(),
                pending: StdMutex::new(PendingTable::default()),
                next_id: AtomicU64::new(1),
                connected,
            }),
            endpoint,
            preopened: StdMutex::new(preopened),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            connect_attempted: AtomicBool::new(false),
            read_task: StdMutex::new(None),
        }
    }

    /// Set the timeout used for HTTP connection setup and the liveness check.
    pub fn set_http_timeout(&mut self, timeout: Duration) {
        self.http_timeout = timeout;
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Open the transport and start the read loop.
    pub async fn connect(&self) -> Result<(), McpError> {
        if self.connect_attempted.swap(true, Ordering::SeqCst) {
            return Err(McpError::Connection {
                server: self.shared.server_id.clone(),
                reason: ConnectFailure::AlreadyConnected,
                detail: "connect may only be called once per client".into(),
            });
        }

        let preopened = lock(&self.preopened).take();
        let transport = match (preopened, &self.endpoint) {
            (Some(transport), _) => transport,
            (None, Some(endpoint)) => {
                Transport::open(&self.shared.server_id, endpoint, self.http_timeout).await?
            }
            (None, None) => {
                return Err(McpError::Connection {
                    server: self.shared.server_id.clone(),
                    reason: ConnectFailure::InvalidUrl,
                    detail: "client has neither an endpoint nor a transport".into(),
                })
            }
        };

        let is_stream = matches!(transport, Transport::Stream(_));
        if self.shared.transport.set(transport).is_err() {
            return Err(McpError::Connection {
                server: self.shared.server_id.clone(),
                reason: ConnectFailure::AlreadyConnected,
                detail: "transport already installed".into(),
            });
        }

        self.shared.pending().open = true;
        self.shared.connected.send_replace(true);

        if is_stream {
            let shared = self.shared.clone();
            *lock(&self.read_task) = Some(tokio::spawn(read_loop(shared)));
        }

        tracing::info!(server = %self.shared.server_id, stream = is_stream, "connected");
        Ok(())
    }

    /// Close the transport and fail all pending requests. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.shared.transport.get() {
            transport.close().await;
        }
        self.shared.shut_down("disconnected by client");

        let task = lock(&self.read_task).take();
        if let Some(task) = task {
            if tokio::time::timeout(READ_LOOP_JOIN_TIMEOUT, task).await.is_err() {
                tracing::warn!(server = %self.shared.server_id, "read loop did not stop in time");
            }
        }
    }

    /// Whether the connection is currently usable.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Watch the connected flag; it flips to `false` when the connection ends.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Response time measured while connecting, for HTTP servers.
    pub fn connect_latency(&self) -> Option<Duration> {
        self.shared.transport.get().and_then(Transport::open_latency)
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().slots.len()
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Send a request and wait for its response.
    ///
    /// Fails with `Timeout` if no response arrives in time (a late response
    /// is dropped), `Disconnected` if the connection ends first, or `Remote`
    /// if the server answers with an error object.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let transport = self
            .shared
            .transport
            .get()
            .ok_or_else(|| self.shared.disconnected())?;

        match transport {
            Transport::Stream(stream) => self.call_stream(stream, method, params, timeout).await,
            Transport::Http(http) => self.call_http(http, method, params, timeout).await,
        }
    }

    async fn call_stream(
        &self,
        stream: &StreamTransport,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.shared.next_request_id();
        let frame = self.encode(&Request::new(&id, method, params))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.register(&id, method, reply_tx)?;

        if let Err(e) = stream.write_line(&frame).await {
            self.shared.discard(&id);
            tracing::warn!(
                server = %self.shared.server_id,
                request_id = %id,
                error = %e,
                "write failed, disconnecting"
            );
            self.disconnect().await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.shared.disconnected()),
            Err(_) => {
                self.shared.discard(&id);
                tracing::debug!(
                    server = %self.shared.server_id,
                    request_id = %id,
                    method,
                    "call timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn call_http(
        &self,
        http: &HttpTransport,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        if !self.shared.pending().open {
            return Err(self.shared.disconnected());
        }

        let id = self.shared.next_request_id();
        let frame = self.encode(&Request::new(&id, method, params))?;

        let body = http.exchange(method, frame, timeout).await?;

        let response = decode_response(&body).map_err(|e| McpError::Protocol {
            server: self.shared.server_id.clone(),
            reason: format!("invalid response body: {e}"),
        })?;
        if response.id != id {
            return Err(McpError::Protocol {
                server: self.shared.server_id.clone(),
                reason: format!("response id '{}' does not match request '{id}'", response.id),
            });
        }
        response.into_result()
    }

    fn encode(&self, request: &Request) -> Result<String, McpError> {
        serde_json::to_string(request).map_err(|e| McpError::Protocol {
            server: self.shared.server_id.clone(),
            reason: format!("failed to serialize request: {e}"),
        })
    }

    // ─── Convenience ─────────────────────────────────────────────────────

    /// Ask the server for its metadata.
    pub async fn get_server_info(&self, timeout: Duration) -> Result<Value, McpError> {
        self.call(McpMethod::GetServerInfo.as_str(), None, timeout).await
    }

    /// Ask the server for its tool names.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<String>, McpError> {
        let result = self.call(McpMethod::ListTools.as_str(), None, timeout).await?;
        Ok(tool_names(&result))
    }

    /// Invoke a tool by name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        self.call(McpMethod::CallTool.as_str(), Some(params), timeout).await
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.read_task).take() {
            task.abort();
        }
        if let Some(Transport::Stream(stream)) = self.shared.transport.get() {
            stream.request_close();
        }
        self.shared.shut_down("client dropped");
    }
}

/// Read frames until the stream ends, then fail whatever is still pending.
async fn read_loop(shared: Arc<Shared>) {
    let Some(Transport::Stream(stream)) = shared.transport.get() else {
        return;
    };

    let reason = loop {
        match stream.read_line().await {
            Ok(Some(line)) => shared.dispatch(&line),
            Ok(None) => break "end of stream".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    shared.shut_down(&reason);
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_http::HttpStub;
    use crate::mcp_client::types::Response;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// The server end of an in-memory connection.
    struct FakeServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn next_request(&mut self) -> Request {
            let line = self.lines.next_line().await.unwrap().expect("client closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn reply(&mut self, response: &Response) {
            let line = serde_json::to_string(response).unwrap();
            self.send_raw(&line).await;
        }
    }

    async fn connected_pair() -> (Arc<McpClient>, FakeServer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (read_half, write_half) = tokio::io::split(local);
        let transport = StreamTransport::from_streams("fake", read_half, write_half);
        let client = Arc::new(McpClient::from_transport("fake", Transport::Stream(transport)));
        client.connect().await.unwrap();

        let (server_read, server_write) = tokio::io::split(remote);
        let server = FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (client, server)
    }

    fn spawn_call(
        client: &Arc<McpClient>,
        method: &'static str,
        timeout: Duration,
    ) -> JoinHandle<Result<Value, McpError>> {
        let client = client.clone();
        tokio::spawn(async move { client.call(method, None, timeout).await })
    }

    #[tokio::test]
    async fn test_round_trip_resolves_once() {
        let (client, mut server) = connected_pair().await;
        let call = spawn_call(&client, "get_server_info", Duration::from_secs(2));

        let request = server.next_request().await;
        assert_eq!(request.method, "get_server_info");
        assert!(request.params.is_none());
        server
            .reply(&Response::success(&request.id, serde_json::json!({"name": "X"})))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"name": "X"}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_unique() {
        let (client, mut server) = connected_pair().await;
        let first = spawn_call(&client, "list_tools", Duration::from_secs(2));
        let a = server.next_request().await;
        let second = spawn_call(&client, "list_tools", Duration::from_secs(2));
        let b = server.next_request().await;
        assert_ne!(a.id, b.id);

        server.reply(&Response::success(&a.id, Value::Null)).await;
        server.reply(&Response::success(&b.id, Value::Null)).await;
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (client, mut server) = connected_pair().await;
        let first = spawn_call(&client, "get_server_info", Duration::from_secs(2));
        let a = server.next_request().await;
        let second = spawn_call(&client, "list_tools", Duration::from_secs(2));
        let b = server.next_request().await;

        server.reply(&Response::success(&b.id, serde_json::json!("second"))).await;
        server.reply(&Response::success(&a.id, serde_json::json!("first"))).await;

        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("first"));
        assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("second"));
    }

    #[tokio::test]
    async fn test_remote_error_passes_through() {
        let (client, mut server) = connected_pair().await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_tool("nope", serde_json::json!({}), Duration::from_secs(2))
                    .await
            })
        };

        let request = server.next_request().await;
        assert_eq!(request.method, "call_tool");
        assert_eq!(request.params.as_ref().unwrap()["name"], "nope");
        server
            .reply(&Response::failure(&request.id, -32000, "unknown tool: nope"))
            .await;

        match call.await.unwrap() {
            Err(McpError::Remote { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "unknown tool: nope");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_discards_late_response() {
        let (client, mut server) = connected_pair().await;

        let started = Instant::now();
        let err = client
            .call("get_server_info", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, McpError::Timeout { timeout_ms: 100, .. }));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(client.pending_count(), 0);

        // The late answer must not resolve the next call.
        let stale = server.next_request().await;
        server.reply(&Response::success(&stale.id, serde_json::json!("stale"))).await;

        let call = spawn_call(&client, "list_tools", Duration::from_secs(2));
        let fresh = server.next_request().await;
        assert_ne!(fresh.id, stale.id);
        server.reply(&Response::success(&fresh.id, serde_json::json!("fresh"))).await;
        assert_eq!(call.await.unwrap().unwrap(), serde_json::json!("fresh"));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_fans_out_to_all_pending() {
        let (client, mut server) = connected_pair().await;
        let calls: Vec<_> = (0..3)
            .map(|_| spawn_call(&client, "list_tools", Duration::from_secs(10)))
            .collect();
        for _ in 0..3 {
            server.next_request().await;
        }
        assert_eq!(client.pending_count(), 3);

        drop(server);

        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .expect("pending call must not hang")
                .unwrap();
            assert!(matches!(result, Err(McpError::Disconnected { .. })));
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_disconnect() {
        let (client, mut server) = connected_pair().await;
        let call = spawn_call(&client, "get_server_info", Duration::from_secs(2));
        let request = server.next_request().await;

        server.send_raw("this is not json").await;
        server.send_raw(r#"{"id": 5, "result": true}"#).await;
        server.send_raw("").await;
        server
            .reply(&Response::success(&request.id, serde_json::json!({"ok": true})))
            .await;

        assert_eq!(call.await.unwrap().unwrap(), serde_json::json!({"ok": true}));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_client_disconnect_fails_pending_and_is_idempotent() {
        let (client, mut server) = connected_pair().await;
        let call = spawn_call(&client, "list_tools", Duration::from_secs(10));
        server.next_request().await;

        client.disconnect().await;
        client.disconnect().await;

        assert!(matches!(
            call.await.unwrap(),
            Err(McpError::Disconnected { .. })
        ));
        assert!(!client.is_connected());
        assert!(matches!(
            client.call("list_tools", None, Duration::from_secs(1)).await,
            Err(McpError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (client, _server) = connected_pair().await;
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.connect_failure(), Some(ConnectFailure::AlreadyConnected));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_call_before_connect_fails() {
        let descriptor = ServerDescriptor::new("idle", "Idle", "stdio://cat");
        let client = McpClient::new(&descriptor).unwrap();
        assert!(!client.is_connected());
        assert!(matches!(
            client.call("list_tools", None, Duration::from_millis(50)).await,
            Err(McpError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_tools_extracts_names() {
        let (client, mut server) = connected_pair().await;
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.list_tools(Duration::from_secs(2)).await })
        };
        let request = server.next_request().await;
        server
            .reply(&Response::success(
                &request.id,
                serde_json::json!({"tools": [{"name": "echo"}, {"name": "sleep"}]}),
            ))
            .await;
        assert_eq!(call.await.unwrap().unwrap(), vec!["echo", "sleep"]);
    }

    #[test]
    fn test_new_rejects_bad_descriptor() {
        let descriptor = ServerDescriptor::new("bad", "Bad", "ftp://example.com");
        assert!(matches!(
            McpClient::new(&descriptor),
            Err(McpError::InvalidDescriptor { .. })
        ));
    }

    async fn http_client(stub: &HttpStub) -> McpClient {
        let descriptor = ServerDescriptor::new("web", "Web", &stub.url());
        let client = McpClient::new(&descriptor).unwrap();
        client.connect().await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_http_call_round_trip() {
        let stub = HttpStub::serve(|req| {
            Response::success(&req.id, serde_json::json!({"tools": [{"name": "echo"}]}))
        })
        .await;
        let client = http_client(&stub).await;

        assert!(client.is_connected());
        assert!(client.connect_latency().is_some());
        assert_eq!(client.list_tools(Duration::from_secs(2)).await.unwrap(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_http_remote_error_passes_through() {
        let stub = HttpStub::serve(|req| Response::failure(&req.id, -32601, "no such method")).await;
        let client = http_client(&stub).await;

        match client.call("frobnicate", None, Duration::from_secs(2)).await {
            Err(McpError::Remote { code, .. }) => assert_eq!(code, -32601),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_response_id_mismatch_is_protocol_error() {
        let stub = HttpStub::serve(|_| Response::success("req_999", Value::Null)).await;
        let client = http_client(&stub).await;

        match client.call("list_tools", None, Duration::from_secs(2)).await {
            Err(McpError::Protocol { reason, .. }) => assert!(reason.contains("req_999")),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }
}
