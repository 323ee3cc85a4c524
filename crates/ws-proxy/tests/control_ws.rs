//! End-to-end tests for the control channel and bridge routes.
//!
//! These drive a real listener over loopback with a WebSocket client.
//! Engine-dependent flows use `/bin/false` as the engine binary, which
//! exercises the failure paths deterministically; tests that need a real
//! engine are `#[ignore]`d with the reason.

use futures::{SinkExt, StreamExt};
use proxy_engine::EngineConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use ws_proxy::router::build_router;
use ws_proxy::state::{ProxyConfig, ProxyState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    _root: tempfile::TempDir,
    _staging: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let config = ProxyConfig {
        engine: EngineConfig::new("/bin/false"),
        root: root.path().canonicalize().unwrap(),
        port: 0,
    };
    let state = Arc::new(ProxyState::new(config, staging.path().to_path_buf()));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let router = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestServer {
        port,
        _root: root,
        _staging: staging,
    }
}

async fn connect(server: &TestServer, route: &str) -> Client {
    let url = format!("ws://127.0.0.1:{}{}", server.port, route);
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

async fn send_request(client: &mut Client, id: u64, action: &str, payload: Value) {
    let frame = proxy_protocol::request(id, action, payload).to_string();
    client.send(Message::Text(frame.into())).await.unwrap();
}

/// Read frames until the response matching `id` arrives, skipping events.
async fn read_response(client: &mut Client, id: u64) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(15), client.next())
            .await
            .expect("response deadline")
            .expect("socket open")
            .expect("frame ok");
        let Message::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        if value.get("event").is_some() {
            continue;
        }
        if value.get("id").and_then(Value::as_u64) == Some(id) {
            return value;
        }
    }
}

async fn roundtrip(client: &mut Client, id: u64, action: &str, payload: Value) -> Value {
    send_request(client, id, action, payload).await;
    read_response(client, id).await
}

#[tokio::test]
async fn test_upload_download_roundtrip() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "fs/mkdir", json!({"args": ["a"]})).await;
    assert_eq!(resp["status"], "success");

    let resp = roundtrip(
        &mut client,
        2,
        "fs/upld",
        json!({"args": ["a/b.bin"], "data": "aGVsbG8="}),
    )
    .await;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["data"]["path"], "a/b.bin");

    let resp = roundtrip(&mut client, 3, "fs/dwnl", json!({"args": ["a/b.bin"]})).await;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["data"], "aGVsbG8=");
}

#[tokio::test]
async fn test_upload_without_parent_is_enoent() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(
        &mut client,
        1,
        "fs/upld",
        json!({"args": ["missing/b.bin"], "data": "aGVsbG8="}),
    )
    .await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "enoent");
}

#[tokio::test]
async fn test_path_escape_is_rejected() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "fs/list", json!({"args": ["../.."]})).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "path-escape");
}

#[tokio::test]
async fn test_version_mismatch_has_no_side_effects() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let frame = json!({
        "version": "9.0.0",
        "id": 1,
        "action": "fs/mkdir",
        "payload": {"args": ["newdir"]},
    })
    .to_string();
    client.send(Message::Text(frame.into())).await.unwrap();
    let resp = read_response(&mut client, 1).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "version-mismatch");

    // the directory must not have been created
    let resp = roundtrip(&mut client, 2, "fs/stat", json!({"args": ["newdir"]})).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "enoent");
}

#[tokio::test]
async fn test_unknown_action_is_unsupported() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "fs/format", json!({"args": ["/"]})).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "unsupported-action");

    let resp = roundtrip(&mut client, 2, "reboot", json!({})).await;
    assert_eq!(resp["error"], "unsupported-action");
}

#[tokio::test]
async fn test_malformed_envelope_is_bad_request() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    // missing the action field, but the id is recoverable
    let frame = json!({"version": "0.0.1", "id": 9}).to_string();
    client.send(Message::Text(frame.into())).await.unwrap();
    let resp = read_response(&mut client, 9).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "bad-request");
}

#[tokio::test]
async fn test_concurrent_requests_preserve_ids() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    for id in [10u64, 11, 12] {
        send_request(&mut client, id, "fs/list", json!({"args": [""]})).await;
    }

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let message = tokio::time::timeout(Duration::from_secs(15), client.next())
            .await
            .expect("response deadline")
            .unwrap()
            .unwrap();
        let Message::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            assert_eq!(value["status"], "success");
            seen.push(id);
        }
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![10, 11, 12]);
}

#[tokio::test]
async fn test_second_session_same_workspace_is_busy() {
    let server = start_server().await;
    let mut first = connect(&server, "/proxy/shared").await;
    let resp = roundtrip(&mut first, 1, "status", json!({})).await;
    assert_eq!(resp["status"], "success");

    let mut second = connect(&server, "/proxy/shared").await;
    let message = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = message else {
        panic!("expected a rejection frame, got {message:?}");
    };
    let value: Value = serde_json::from_str(text.as_str()).unwrap();
    assert_eq!(value["status"], "failure");
    assert_eq!(value["error"], "busy");

    // a different workspace is fine
    let mut other = connect(&server, "/proxy/other").await;
    let resp = roundtrip(&mut other, 1, "status", json!({})).await;
    assert_eq!(resp["status"], "success");
}

#[tokio::test]
async fn test_workspace_released_after_close() {
    let server = start_server().await;
    let client = connect(&server, "/proxy/cycling").await;
    drop(client);
    // closing the first session frees the workspace for the next one
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut client = connect(&server, "/proxy/cycling").await;
    let resp = roundtrip(&mut client, 1, "status", json!({})).await;
    assert_eq!(resp["status"], "success");
}

#[tokio::test]
async fn test_workspaces_are_isolated() {
    let server = start_server().await;
    let mut alpha = connect(&server, "/proxy/alpha").await;
    let mut beta = connect(&server, "/proxy/beta").await;

    let resp = roundtrip(
        &mut alpha,
        1,
        "fs/upld",
        json!({"args": ["only-in-alpha"], "data": "eA=="}),
    )
    .await;
    assert_eq!(resp["status"], "success");

    let resp = roundtrip(&mut beta, 1, "fs/stat", json!({"args": ["only-in-alpha"]})).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "enoent");
}

#[tokio::test]
async fn test_status_heartbeat_and_engine_query() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "status", json!({})).await;
    assert_eq!(resp["status"], "success");
    assert_eq!(resp["data"]["workspace"], "demo");
    assert_eq!(resp["data"]["version"], "0.0.1");
    assert_eq!(resp["data"]["state"], "connected");

    let resp = roundtrip(&mut client, 2, "status", json!({"name": "renode"})).await;
    assert_eq!(resp["status"], "failure");
    assert_eq!(resp["error"], "engine-not-running");
}

#[tokio::test]
async fn test_engine_actions_require_running_engine() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "kill", json!({"name": "renode"})).await;
    assert_eq!(resp["error"], "engine-not-running");

    let resp = roundtrip(
        &mut client,
        2,
        "exec-monitor",
        json!({"commands": ["version"]}),
    )
    .await;
    assert_eq!(resp["error"], "engine-not-running");

    let resp = roundtrip(
        &mut client,
        3,
        "exec-renode",
        json!({"command": "machines"}),
    )
    .await;
    assert_eq!(resp["error"], "engine-not-running");
}

#[tokio::test]
async fn test_spawn_failure_leaves_session_usable() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    // /bin/false exits immediately, so spawn reports a startup failure
    let resp = roundtrip(&mut client, 1, "spawn", json!({"name": "renode"})).await;
    assert_eq!(resp["status"], "failure");
    let error = resp["error"].as_str().unwrap();
    assert!(
        error == "spawn-failed" || error == "spawn-timeout",
        "unexpected error: {error}"
    );

    // filesystem operations still work afterwards
    let resp = roundtrip(&mut client, 2, "fs/list", json!({"args": [""]})).await;
    assert_eq!(resp["status"], "success");
}

#[tokio::test]
async fn test_spawn_for_other_software_is_bad_request() {
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "spawn", json!({"name": "gdb"})).await;
    assert_eq!(resp["error"], "bad-request");
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/nope/route", server.port);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}

#[tokio::test]
async fn test_telnet_bridge_shuttles_bytes() {
    let server = start_server().await;

    // stand-in for the engine's monitor telnet: a plain TCP echo server
    let echo = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let echo_port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = echo.accept().await.unwrap();
        let (mut read, mut write) = stream.into_split();
        let mut buf = [0u8; 1024];
        loop {
            match read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut client = connect(&server, &format!("/telnet/{echo_port}")).await;
    client
        .send(Message::Binary(b"hello bridge".as_slice().into()))
        .await
        .unwrap();

    let mut received = Vec::new();
    while received.len() < b"hello bridge".len() {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .expect("bridge deadline")
            .unwrap()
            .unwrap();
        if let Message::Binary(bytes) = message {
            received.extend_from_slice(&bytes);
        }
    }
    assert_eq!(received, b"hello bridge");
}

#[tokio::test]
async fn test_uart_route_without_registration_is_404() {
    let server = start_server().await;
    let url = format!("ws://127.0.0.1:{}/uart/m0/sysbus.uart0", server.port);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected HTTP 404, got {other:?}"),
    }
}

#[tokio::test]
#[ignore = "requires a real engine binary on PATH"]
async fn test_spawn_kill_emits_quit_event() {
    // With a real engine: spawn succeeds within 10.5 s, kill replies
    // success, and a renode-quitted event follows within 2 s.
    let server = start_server().await;
    let mut client = connect(&server, "/proxy/demo").await;

    let resp = roundtrip(&mut client, 1, "spawn", json!({"name": "renode"})).await;
    assert_eq!(resp["status"], "success");

    // the per-spawn endpoints are discoverable through status
    let resp = roundtrip(&mut client, 2, "status", json!({"name": "renode"})).await;
    assert_eq!(resp["status"], "success");
    assert!(resp["data"]["monitorPort"].as_u64().unwrap() > 0);
    assert!(resp["data"]["analyzerPort"].as_u64().unwrap() > 0);

    let resp = roundtrip(&mut client, 3, "kill", json!({"name": "renode"})).await;
    assert_eq!(resp["status"], "success");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let message = tokio::time::timeout(remaining, client.next())
            .await
            .expect("event deadline")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value.get("event").and_then(Value::as_str) == Some("renode-quitted") {
                break;
            }
        }
    }
}
