//! End-to-end tests against the `mcop-echo-server` binary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mcop::mcp_client::transport::StreamTransport;
use mcop::mcp_client::types::{decode_response, error_codes, Outcome};
use mcop::mcp_client::{ConnectionRegistry, McpClient, McpError, ServerDescriptor, ServerStatus};

const CALL_TIMEOUT: Duration = Duration::from_secs(5);

fn echo_url(extra: &str) -> String {
    format!("stdio://\"{}\" {extra}", env!("CARGO_BIN_EXE_mcop-echo-server"))
}

fn echo_descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor::new(id, "Echo", &echo_url("--name 'Echo One'"))
}

async fn connected_client() -> McpClient {
    let client = McpClient::new(&echo_descriptor("echo1")).unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_registry_end_to_end() {
    let (registry, _) = ConnectionRegistry::from_descriptors(
        vec![echo_descriptor("echo1")],
        Duration::from_secs(1),
    );

    registry.start("echo1").await.unwrap();
    assert_eq!(registry.status("echo1").unwrap(), ServerStatus::Running);

    let info = registry
        .call("echo1", "get_server_info", None, CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(info["name"], "Echo One");

    let tools = registry.refresh_tools("echo1", CALL_TIMEOUT).await.unwrap();
    assert_eq!(tools, vec!["echo", "sleep", "hang", "garbage"]);

    let snap = registry.server_snapshot("echo1").unwrap();
    assert_eq!(snap.tools, tools);
    assert_eq!(snap.active_connections, 1);
    assert!(snap.last_response_time.is_some());

    let params = json!({"name": "nope", "arguments": {}});
    match registry.call("echo1", "call_tool", Some(params), CALL_TIMEOUT).await {
        Err(McpError::Remote { code, message }) => {
            assert_eq!(code, -32000);
            assert_eq!(message, "unknown tool: nope");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    // A remote error is not a transport fault.
    assert_eq!(registry.status("echo1").unwrap(), ServerStatus::Running);
    assert!(registry.server_snapshot("echo1").unwrap().last_response_time.is_some());

    let params = json!({"name": "sleep", "arguments": {"ms": 300}});
    registry
        .call("echo1", "call_tool", Some(params), CALL_TIMEOUT)
        .await
        .unwrap();
    let latency = registry.server_snapshot("echo1").unwrap().last_response_time;
    assert!(latency.is_some_and(|t| t >= Duration::from_millis(300)));

    registry.stop("echo1").await.unwrap();
    assert_eq!(registry.status("echo1").unwrap(), ServerStatus::Stopped);
}

#[tokio::test]
async fn test_echo_tool_returns_arguments() {
    let client = connected_client().await;
    let args = json!({"text": "hello", "n": 3});
    let result = client.call_tool("echo", args.clone(), CALL_TIMEOUT).await.unwrap();
    assert_eq!(result, args);
    client.disconnect().await;
}

#[tokio::test]
async fn test_fast_call_overtakes_slow_call() {
    let client = Arc::new(connected_client().await);

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call_tool("sleep", json!({"ms": 400}), CALL_TIMEOUT)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = client
        .call_tool("echo", json!("quick"), CALL_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(fast, json!("quick"));
    assert!(!slow.is_finished());

    assert_eq!(slow.await.unwrap().unwrap(), json!({"slept_ms": 400}));
    client.disconnect().await;
}

#[tokio::test]
async fn test_timeout_leaves_connection_usable() {
    let client = connected_client().await;

    let err = client
        .call_tool("hang", json!({}), Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout { .. }));
    assert!(client.is_connected());

    let result = client.call_tool("echo", json!(1), CALL_TIMEOUT).await.unwrap();
    assert_eq!(result, json!(1));
    client.disconnect().await;
}

#[tokio::test]
async fn test_garbage_line_is_survived() {
    let client = connected_client().await;
    let result = client.call_tool("garbage", json!({}), CALL_TIMEOUT).await.unwrap();
    assert_eq!(result, json!("ok"));
    assert!(client.is_connected());
    client.disconnect().await;
}

#[tokio::test]
async fn test_unknown_method_is_rejected() {
    let client = connected_client().await;
    match client.call("initialize", None, CALL_TIMEOUT).await {
        Err(McpError::Remote { code, .. }) => assert_eq!(code, error_codes::METHOD_NOT_FOUND),
        other => panic!("expected method-not-found, got {other:?}"),
    }
    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_request_gets_parse_error() {
    let transport =
        StreamTransport::spawn("raw", env!("CARGO_BIN_EXE_mcop-echo-server"), &[]).unwrap();
    transport.write_line("{ definitely not json").await.unwrap();

    let line = tokio::time::timeout(CALL_TIMEOUT, transport.read_line())
        .await
        .expect("server should answer")
        .unwrap()
        .expect("server closed stdout");
    let response = decode_response(&line).unwrap();
    assert_eq!(response.id, "unknown");
    match response.outcome {
        Outcome::Failure { error } => assert_eq!(error.code, error_codes::PARSE_ERROR),
        other => panic!("expected failure, got {other:?}"),
    }
    transport.close().await;
}

#[tokio::test]
async fn test_client_disconnect_fails_pending_calls() {
    let client = Arc::new(connected_client().await);
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call_tool("hang", json!({}), CALL_TIMEOUT).await })
        })
        .collect();

    while client.pending_count() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    client.disconnect().await;

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("pending call must not hang")
            .unwrap();
        assert!(matches!(result, Err(McpError::Disconnected { .. })));
    }
}

/// The server process dies on its own after reading three requests.
#[cfg(unix)]
#[tokio::test]
async fn test_process_death_fails_all_pending_calls() {
    let descriptor =
        ServerDescriptor::new("dies", "Dies", r#"stdio://sh -c "head -n 3 > /dev/null""#);
    let client = Arc::new(McpClient::new(&descriptor).unwrap());
    client.connect().await.unwrap();

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.call("list_tools", None, Duration::from_secs(10)).await })
        })
        .collect();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(3), call)
            .await
            .expect("pending call must not hang")
            .unwrap();
        assert!(matches!(result, Err(McpError::Disconnected { .. })));
    }
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_concurrent_starts_keep_one_connection() {
    let registry = Arc::new(
        ConnectionRegistry::from_descriptors(vec![echo_descriptor("echo1")], Duration::from_secs(1)).0,
    );

    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.start("echo1").await })
        })
        .collect();

    let mut started = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(()) => started += 1,
            Err(McpError::AlreadyRunning { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(started, 1);
    assert_eq!(registry.disconnect_all().await, 1);
}

#[tokio::test]
async fn test_failed_start_then_retry_succeeds() {
    let (registry, _) = ConnectionRegistry::from_descriptors(
        vec![ServerDescriptor::new("flaky", "Flaky", "stdio:///nonexistent/mcop-missing")],
        Duration::from_secs(1),
    );

    assert!(registry.start("flaky").await.is_err());
    assert_eq!(registry.status("flaky").unwrap(), ServerStatus::Error);

    registry.update(echo_descriptor("flaky")).unwrap();
    registry.start("flaky").await.unwrap();
    assert_eq!(registry.status("flaky").unwrap(), ServerStatus::Running);
    assert!(registry.server_snapshot("flaky").unwrap().last_error.is_none());
    registry.stop("flaky").await.unwrap();
}
