//! Minimal stdio MCP server used for manual testing and the integration tests.
//!
//! Reads one JSON request per line from stdin and answers each on stdout,
//! concurrently, so slow tools do not hold up fast ones. Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;

use mcop::logging::{init_tracing, LogTarget};
use mcop::mcp_client::types::{encode_frame, error_codes, McpMethod, Request, Response};

/// Stdio MCP test server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name reported by get_server_info
    #[arg(short, long, default_value = "mcop-echo-server")]
    name: String,
}

const TOOLS: [(&str, &str); 4] = [
    ("echo", "Return the arguments unchanged"),
    ("sleep", "Reply after `ms` milliseconds"),
    ("hang", "Never reply"),
    ("garbage", "Write a non-JSON line, then reply"),
];

type SharedStdout = Arc<Mutex<Stdout>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(LogTarget::Stderr);

    let name = Arc::new(args.name);
    let stdout: SharedStdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let name = name.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_line(&name, &line, &stdout).await {
                tracing::warn!(error = %e, "failed to answer request");
            }
        });
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn handle_line(name: &str, line: &str, stdout: &SharedStdout) -> Result<()> {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            let response = Response::failure("unknown", error_codes::PARSE_ERROR, format!("parse error: {e}"));
            return write_frame(stdout, &encode_frame(&response)?).await;
        }
    };
    tracing::debug!(id = %request.id, method = %request.method, "request");

    let method = match McpMethod::try_from(request.method.as_str()) {
        Ok(method) => method,
        Err(message) => {
            let response = Response::failure(&request.id, error_codes::METHOD_NOT_FOUND, message);
            return write_frame(stdout, &encode_frame(&response)?).await;
        }
    };

    let response = match method {
        McpMethod::GetServerInfo => Response::success(
            &request.id,
            json!({
                "name": name,
                "version": env!("CARGO_PKG_VERSION"),
                "description": "Echo server for exercising MCP clients",
            }),
        ),
        McpMethod::ListTools => {
            let tools: Vec<Value> = TOOLS
                .iter()
                .map(|(tool, description)| json!({"name": tool, "description": description}))
                .collect();
            Response::success(&request.id, json!({ "tools": tools }))
        }
        McpMethod::CallTool => match call_tool(&request, stdout).await? {
            Some(response) => response,
            None => return Ok(()),
        },
    };

    write_frame(stdout, &encode_frame(&response)?).await
}

/// Run a tool. `None` means no reply is ever sent.
async fn call_tool(request: &Request, stdout: &SharedStdout) -> Result<Option<Response>> {
    let params = request.params.clone().unwrap_or(Value::Null);
    let Some(tool) = params.get("name").and_then(Value::as_str) else {
        return Ok(Some(Response::failure(
            &request.id,
            error_codes::INVALID_PARAMS,
            "missing tool name",
        )));
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let response = match tool {
        "echo" => Response::success(&request.id, arguments),
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Response::success(&request.id, json!({ "slept_ms": ms }))
        }
        "hang" => {
            tracing::debug!(id = %request.id, "hanging on purpose");
            return Ok(None);
        }
        "garbage" => {
            write_frame(stdout, "this line is not json\n").await?;
            Response::success(&request.id, json!("ok"))
        }
        other => Response::failure(
            &request.id,
            error_codes::GENERIC,
            format!("unknown tool: {other}"),
        ),
    };
    Ok(Some(response))
}

async fn write_frame(stdout: &SharedStdout, frame: &str) -> Result<()> {
    let mut out = stdout.lock().await;
    out.write_all(frame.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}
