//! MCP server discovery.
//!
//! - [`discover_local`] probes well-known ports on localhost and produces
//!   descriptors. Registering or merging them is up to the caller.
//! - [`check_configured`] reports liveness, response time and tools for the
//!   configured HTTP servers without registering anything.

use std::collections::HashSet;
use std::time::Duration;

use super::client::McpClient;
use super::transport::probe_url;
use super::types::{Endpoint, ServerDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Ports MCP servers commonly listen on during development.
pub const COMMON_PORTS: [u16; 6] = [3000, 3001, 8000, 8080, 9000, 9001];

/// Probe timeout per port. Short, since these are all loopback.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Discovery ───────────────────────────────────────────────────────────────

/// Descriptor for a server found on `localhost:<port>`.
pub fn local_descriptor(port: u16) -> ServerDescriptor {
    let mut descriptor = ServerDescriptor::new(
        &format!("local_{port}"),
        &format!("Local MCP Server (:{port})"),
        &format!("http://localhost:{port}"),
    );
    descriptor.description = format!("Auto-discovered MCP server on port {port}");
    descriptor
}

/// Probe every port concurrently; return descriptors for those answering 2xx,
/// in the order the ports were given.
pub async fn discover_local(ports: &[u16], timeout: Duration) -> Vec<ServerDescriptor> {
    let probes = ports.iter().map(|&port| async move {
        let descriptor = local_descriptor(port);
        match probe_url(&descriptor.url, timeout).await {
            Ok(elapsed) => {
                tracing::info!(
                    port,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "discovered local MCP server"
                );
                Some(descriptor)
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "no server on port");
                None
            }
        }
    });

    futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect()
}

/// Append discovered descriptors whose URL and id are not already configured.
pub fn merge_discovered(
    configured: &[ServerDescriptor],
    discovered: Vec<ServerDescriptor>,
) -> Vec<ServerDescriptor> {
    let mut urls: HashSet<String> = configured.iter().map(|d| normalize_url(&d.url)).collect();
    let mut ids: HashSet<String> = configured.iter().map(|d| d.id.clone()).collect();

    let mut merged = configured.to_vec();
    for descriptor in discovered {
        if !urls.insert(normalize_url(&descriptor.url)) || !ids.insert(descriptor.id.clone()) {
            continue;
        }
        merged.push(descriptor);
    }
    merged
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

// ─── Configured Servers ──────────────────────────────────────────────────────

/// Health of one configured HTTP server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerHealth {
    pub id: String,
    pub name: String,
    pub url: String,
    pub alive: bool,
    /// Liveness check response time.
    pub response_time: Option<Duration>,
    /// Tool names, when the server answered `list_tools`.
    pub tools: Vec<String>,
    pub error: Option<String>,
}

/// Check every configured `http(s)://` server concurrently, in config order.
///
/// Stdio servers are skipped: checking them would mean spawning them.
pub async fn check_configured(
    descriptors: &[ServerDescriptor],
    timeout: Duration,
) -> Vec<ServerHealth> {
    let checks = descriptors
        .iter()
        .filter(|d| matches!(d.endpoint(), Ok(Endpoint::Http { .. })))
        .map(|descriptor| check_server(descriptor, timeout));
    futures::future::join_all(checks).await
}

async fn check_server(descriptor: &ServerDescriptor, timeout: Duration) -> ServerHealth {
    let mut health = ServerHealth {
        id: descriptor.id.clone(),
        name: descriptor.name.clone(),
        url: descriptor.url.clone(),
        alive: false,
        response_time: None,
        tools: Vec::new(),
        error: None,
    };

    let client = match McpClient::new(descriptor) {
        Ok(mut client) => {
            client.set_http_timeout(timeout);
            client
        }
        Err(e) => {
            health.error = Some(e.to_string());
            return health;
        }
    };
    if let Err(e) = client.connect().await {
        tracing::debug!(server = %descriptor.id, error = %e, "configured server not reachable");
        health.error = Some(e.to_string());
        return health;
    }

    health.alive = true;
    health.response_time = client.connect_latency();
    match client.list_tools(timeout).await {
        Ok(tools) => health.tools = tools,
        Err(e) => {
            tracing::debug!(server = %descriptor.id, error = %e, "list_tools failed");
        }
    }
    client.disconnect().await;

    tracing::info!(
        server = %descriptor.id,
        elapsed_ms = health.response_time.map(|t| t.as_millis() as u64),
        tools = health.tools.len(),
        "configured server is alive"
    );
    health
}

// ─── Tests ───────────────────────────────────────────────────────────────────
