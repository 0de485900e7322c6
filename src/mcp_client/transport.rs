//! Byte-stream transports to MCP servers.
//!
//! - [`StreamTransport`]: newline-delimited frames over a child process's
//!   stdio (or any async reader/writer pair).
//! - [`HttpTransport`]: request-scoped exchange with an HTTP endpoint, plus
//!   the liveness probe.
//!
//! Closing a stream transport unblocks a pending `read_line` immediately; it
//! never waits for the remote process to exit.

use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use reqwest::Client as HttpClient;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

use super::errors::{ConnectFailure, McpError};
use super::types::Endpoint;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound on HTTP connection setup and the liveness check.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for a killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// An open connection to one server endpoint.
pub enum Transport {
    Stream(StreamTransport),
    Http(HttpTransport),
}

impl Transport {
    /// Open a transport for `endpoint`.
    ///
    /// Stdio endpoints spawn the process; HTTP endpoints must pass the
    /// liveness probe within `http_timeout`.
    pub async fn open(
        server: &str,
        endpoint: &Endpoint,
        http_timeout: Duration,
    ) -> Result<Self, McpError> {
        match endpoint {
            Endpoint::Stdio { program, args } => {
                StreamTransport::spawn(server, program, args).map(Transport::Stream)
            }
            Endpoint::Http { base_url } => {
                let transport = HttpTransport::new(server, base_url.clone(), http_timeout)?;
                let elapsed = transport.probe().await?;
                tracing::debug!(
                    server,
                    url = %base_url,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "HTTP endpoint answered liveness probe"
                );
                Ok(Transport::Http(transport))
            }
        }
    }

    /// Response time measured while opening. Only HTTP endpoints have one.
    pub fn open_latency(&self) -> Option<Duration> {
        match self {
            Transport::Stream(_) => None,
            Transport::Http(http) => http.liveness_elapsed(),
        }
    }

    /// Close the transport. Idempotent.
    pub async fn close(&self) {
        match self {
            Transport::Stream(stream) => stream.close().await,
            Transport::Http(_) => {}
        }
    }
}

// ─── Stream Transport ────────────────────────────────────────────────────────

/// Bi-directional line transport over an async reader/writer pair.
///
/// Single-writer discipline is the caller's job; `write_line` may run
/// concurrently with `read_line`.
pub struct StreamTransport {
    server: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BufReader<BoxedReader>>>,
    /// Spawned process, if this transport owns one.
    process: StdMutex<Option<Child>>,
    closed: watch::Sender<bool>,
}

impl StreamTransport {
    /// Wrap an existing reader/writer pair.
    pub fn from_streams<R, W>(server: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, _) = watch::channel(false);
        Self {
            server: server.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            reader: Mutex::new(Some(BufReader::new(Box::new(reader)))),
            process: StdMutex::new(None),
            closed,
        }
    }

    /// Spawn `program args…` with piped stdio and wrap it.
    ///
    /// The child is killed when the transport is closed or dropped. Its
    /// stderr is drained into the log so a chatty server cannot stall.
    pub fn spawn(server: &str, program: &str, args: &[String]) -> Result<Self, McpError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let spawn_failed = |detail: String| McpError::Connection {
            server: server.to_string(),
            reason: ConnectFailure::SpawnFailed,
            detail,
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_failed(format!("failed to start '{program}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, line = %line, "server stderr");
                }
            });
        }

        tracing::info!(
            server,
            program,
            args = ?args,
            pid = child.id(),
            "spawned MCP server process"
        );

        let transport = Self::from_streams(server, stdout, stdin);
        *lock_process(&transport.process) = Some(child);
        Ok(transport)
    }

    /// Write one frame followed by a newline.
    pub async fn write_line(&self, frame: &str) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.io_error("transport closed".into()));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.io_error("transport closed".into()))?;

        writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| self.io_error(format!("failed to write frame: {e}")))?;
        if !frame.ends_with('\n') {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| self.io_error(format!("failed to write frame: {e}")))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| self.io_error(format!("failed to flush frame: {e}")))
    }

    /// Read the next frame, without its line terminator.
    ///
    /// Returns `Ok(None)` on end of stream or once the transport is closed.
    pub async fn read_line(&self) -> Result<Option<String>, McpError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }

        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return Ok(None);
        };

        let mut line = String::new();
        let read = tokio::select! {
            _ = closed.wait_for(|is_closed| *is_closed) => None,
            result = reader.read_line(&mut line) => Some(result),
        };

        match read {
            None => {
                // Release our end of the pipe as soon as we are told to stop.
                guard.take();
                Ok(None)
            }
            Some(Ok(0)) => Ok(None),
            Some(Ok(_)) => Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string())),
            Some(Err(e)) => Err(self.io_error(format!("failed to read frame: {e}"))),
        }
    }

    /// Whether `close` has been requested.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close both pipe ends and kill the owned process, if any. Idempotent.
    pub async fn close(&self) {
        if self.request_close() {
            tracing::debug!(server = %self.server, "closing transport");
        }

        self.writer.lock().await.take();

        let child = lock_process(&self.process).take();
        if let Some(mut child) = child {
            match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server, %status, "server process exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(server = %self.server, error = %e, "failed to reap server process");
                }
                Err(_) => {
                    tracing::warn!(server = %self.server, "server process did not exit after kill");
                }
            }
        }
    }

    /// Mark closed and request process termination without waiting for it.
    /// Returns `true` on the first call.
    pub fn request_close(&self) -> bool {
        let was_closed = self.closed.send_replace(true);
        if let Some(child) = lock_process(&self.process).as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %self.server, error = %e, "kill request failed");
            }
        }
        !was_closed
    }

    fn io_error(&self, reason: String) -> McpError {
        McpError::Io {
            server: self.server.clone(),
            reason,
        }
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.request_close();
    }
}

fn lock_process(process: &StdMutex<Option<Child>>) -> std::sync::MutexGuard<'_, Option<Child>> {
    process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// HTTP exchange scoped to one base URL.
///
/// The client itself only bounds connection setup. The liveness check uses
/// the transport's own timeout and each exchange carries the caller's.
pub struct HttpTransport {
    server: String,
    base_url: reqwest::Url,
    http: HttpClient,
    liveness_timeout: Duration,
    /// Elapsed time of the last successful liveness check.
    liveness_elapsed: StdMutex<Option<Duration>>,
}

impl HttpTransport {
    pub fn new(server: &str, base_url: reqwest::Url, timeout: Duration) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(timeout)
            .user_agent(concat!("mcop/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| McpError::Connection {
                server: server.to_string(),
                reason: ConnectFailure::Unreachable,
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server: server.to_string(),
            base_url,
            http,
            liveness_timeout: timeout,
            liveness_elapsed: StdMutex::new(None),
        })
    }

    pub fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }

    /// GET the base URL; any 2xx answer counts as alive.
    pub async fn probe(&self) -> Result<Duration, McpError> {
        let started = Instant::now();
        let response = self
            .http
            .get(self.base_url.clone())
            .header("Content-Type", "application/json")
            .timeout(self.liveness_timeout)
            .send()
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unreachable(format!("HTTP {status}")));
        }
        let elapsed = started.elapsed();
        *self
            .liveness_elapsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(elapsed);
        Ok(elapsed)
    }

    /// Response time of the last successful liveness check, if any.
    pub fn liveness_elapsed(&self) -> Option<Duration> {
        *self
            .liveness_elapsed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// POST one frame to the base URL and return the response body.
    ///
    /// `timeout` covers the whole exchange, body included; running out of
    /// time is reported as `Timeout` for `method`.
    pub async fn exchange(
        &self,
        method: &str,
        frame: String,
        timeout: Duration,
    ) -> Result<String, McpError> {
        let failed = |e: reqwest::Error, context: &str| {
            if e.is_timeout() {
                McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                McpError::Io {
                    server: self.server.clone(),
                    reason: format!("{context}{e}"),
                }
            }
        };

        let response = self
            .http
            .post(self.base_url.clone())
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(frame)
            .send()
            .await
            .map_err(|e| failed(e, ""))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| failed(e, "failed to read response body: "))?;

        if !status.is_success() {
            return Err(McpError::Io {
                server: self.server.clone(),
                reason: format!("HTTP {status}: {body}"),
            });
        }
        Ok(body)
    }

    fn unreachable(&self, detail: String) -> McpError {
        McpError::Connection {
            server: self.server.clone(),
            reason: ConnectFailure::Unreachable,
            detail: format!("{}: {detail}", self.base_url),
        }
    }
}

/// Probe an `http(s)://` URL for liveness, returning the response time.
pub async fn probe_url(url: &str, timeout: Duration) -> Result<Duration, McpError> {
    let base_url = reqwest::Url::parse(url).map_err(|e| McpError::Connection {
        server: url.to_string(),
        reason: ConnectFailure::InvalidUrl,
        detail: e.to_string(),
    })?;
    HttpTransport::new(url, base_url, timeout)?.probe().await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
