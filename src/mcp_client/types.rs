//! Shared types for the MCP client.
//!
//! Server descriptors, endpoint parsing and the newline-delimited JSON frames
//! exchanged with MCP servers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── Server Descriptor ───────────────────────────────────────────────────────

/// Static description of one MCP server, as stored in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    /// Scheme-prefixed connection target: `stdio://…`, `http://…`, `https://…`.
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// Declared tool names. Informational only.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl ServerDescriptor {
    /// Create a descriptor with no description and no declared tools.
    pub fn new(id: &str, name: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            description: String::new(),
            tools: Vec::new(),
        }
    }

    /// Parse the descriptor URL into a connectable endpoint.
    pub fn endpoint(&self) -> Result<Endpoint, McpError> {
        Endpoint::parse(&self.url).map_err(|reason| McpError::InvalidDescriptor {
            id: self.id.clone(),
            reason,
        })
    }

    /// Check the descriptor can be registered: non-empty id and a usable URL.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.id.trim().is_empty() {
            return Err(McpError::InvalidDescriptor {
                id: self.id.clone(),
                reason: "server id cannot be empty".into(),
            });
        }
        self.endpoint().map(|_| ())
    }
}

/// Check a descriptor set: every descriptor valid and every id unique.
pub fn validate_descriptors(descriptors: &[ServerDescriptor]) -> Result<(), McpError> {
    let mut seen = HashSet::new();
    for descriptor in descriptors {
        descriptor.validate()?;
        if !seen.insert(descriptor.id.as_str()) {
            return Err(McpError::DuplicateServer {
                id: descriptor.id.clone(),
            });
        }
    }
    Ok(())
}

// ─── Endpoint ────────────────────────────────────────────────────────────────

/// Where and how to reach a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Spawn `program args…` and speak over its stdin/stdout.
    Stdio { program: String, args: Vec<String> },
    /// Reach an HTTP endpoint rooted at `base_url`.
    Http { base_url: reqwest::Url },
}

const STDIO_SCHEME: &str = "stdio://";

impl Endpoint {
    /// Parse a scheme-prefixed URL. The error is a human-readable reason.
    pub fn parse(url: &str) -> Result<Self, String> {
        let url = url.trim();
        if url.is_empty() {
            return Err("server URL cannot be empty".into());
        }

        if let Some(command) = url.strip_prefix(STDIO_SCHEME) {
            let mut parts = parse_command(command).into_iter();
            let program = parts
                .next()
                .ok_or_else(|| format!("invalid command: '{command}'"))?;
            return Ok(Endpoint::Stdio {
                program,
                args: parts.collect(),
            });
        }

        if url.starts_with("http://") || url.starts_with("https://") {
            let base_url =
                reqwest::Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
            return Ok(Endpoint::Http { base_url });
        }

        let scheme = url.split("://").next().unwrap_or(url);
        Err(format!("unsupported protocol: '{scheme}'"))
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Endpoint::Stdio { .. } => "stdio",
            Endpoint::Http { .. } => "http",
        }
    }
}

/// Split a shell-like command line into tokens.
///
/// Whitespace separates tokens outside quotes. A `'` or `"` opens a quoted run
/// that only the same character closes; the quote characters themselves are
/// dropped. Empty tokens are never produced.
pub fn parse_command(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in command.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => quote = Some(ch),
            None if ch.is_whitespace() => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            None => current.push(ch),
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

// ─── Wire Frames ─────────────────────────────────────────────────────────────

/// Methods understood by MCP servers in this protocol dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMethod {
    CallTool,
    ListTools,
    GetServerInfo,
}

impl McpMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CallTool => "call_tool",
            Self::ListTools => "list_tools",
            Self::GetServerInfo => "get_server_info",
        }
    }
}

impl TryFrom<&str> for McpMethod {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "call_tool" => Ok(Self::CallTool),
            "list_tools" => Ok(Self::ListTools),
            "get_server_info" => Ok(Self::GetServerInfo),
            other => Err(format!("unknown method: {other}")),
        }
    }
}

/// A request frame: `{"id", "method", "params"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: &str, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteErrorBody {
    pub code: i64,
    pub message: String,
}

/// The two shapes a response can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outcome {
    Failure { error: RemoteErrorBody },
    Success { result: serde_json::Value },
}

/// A response frame: `{"id", "result"}` or `{"id", "error": {code, message}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    pub fn success(id: &str, result: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            outcome: Outcome::Success { result },
        }
    }

    pub fn failure(id: &str, code: i64, message: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            outcome: Outcome::Failure {
                error: RemoteErrorBody {
                    code,
                    message: message.into(),
                },
            },
        }
    }

    /// Convert into the caller-facing result; remote errors pass through verbatim.
    pub fn into_result(self) -> Result<serde_json::Value, McpError> {
        match self.outcome {
            Outcome::Success { result } => Ok(result),
            Outcome::Failure { error } => Err(McpError::Remote {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

/// Encode a frame as one newline-terminated line.
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line into a response frame.
pub fn decode_response(line: &str) -> Result<Response, serde_json::Error> {
    serde_json::from_str(line.trim())
}

/// Extract tool names from a `list_tools` result.
///
/// Accepts `{"tools": [...]}` or a bare array; entries may be tool objects
/// with a `name` field or plain strings.
pub fn tool_names(result: &serde_json::Value) -> Vec<String> {
    let entries: &[serde_json::Value] = match result {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("tools") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            serde_json::Value::String(name) => Some(name.clone()),
            serde_json::Value::Object(obj) => {
                obj.get("name").and_then(|n| n.as_str()).map(String::from)
            }
            _ => None,
        })
        .collect()
}

// ─── Error Codes ─────────────────────────────────────────────────────────────

/// Error codes used on the wire. All are negative.
pub mod error_codes {
    /// Generic server-side failure.
    pub const GENERIC: i64 = -32000;
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
