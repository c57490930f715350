//! End-to-end tests for the `/ws` terminal endpoint against a live server.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use th_bridge::http_api::{api_router, ApiState};
use th_session::{AdmissionController, SessionConfig};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const ORIGIN: &str = "http://localhost:5173";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    base: String,
    state: Arc<ApiState>,
    _apps: tempfile::TempDir,
}

/// Spin up the API on a random port with a testapp fixture in a temp dir.
async fn start_test_server() -> TestServer {
    let apps = tempfile::tempdir().expect("tempdir");
    let testapp = apps.path().join("testapp");
    std::fs::write(
        &testapp,
        "#!/bin/sh\nwhile IFS= read -r line; do\n  case \"$line\" in quit|exit) exit 0 ;; esac\n  echo \"You typed: $line\"\ndone\n",
    )
    .expect("write testapp");
    std::fs::set_permissions(&testapp, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let config = SessionConfig {
        apps_directory: apps.path().to_path_buf(),
        allowed_apps: BTreeMap::from([("testapp".to_string(), "Echo tester".to_string())]),
        allowed_origins: vec![ORIGIN.to_string()],
    };
    let state = Arc::new(ApiState::from_parts(
        config,
        Arc::new(AdmissionController::new(1)),
    ));
    let router = api_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        state,
        _apps: apps,
    }
}

async fn connect(base: &str, origin: Option<&'static str>) -> Result<WsStream, String> {
    let ws_url = base.replace("http://", "ws://") + "/ws";
    let mut request = ws_url.into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_static(origin));
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
        .map_err(|e| e.to_string())
}

async fn send(ws: &mut WsStream, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

/// Read `output` frames until `needle` appears; returns everything read.
async fn read_until(ws: &mut WsStream, needle: &str) -> String {
    let mut collected = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !collected.contains(needle) {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: serde_json::Value =
                    serde_json::from_str(text.as_str()).expect("outbound frames are JSON");
                collected.push_str(frame["output"].as_str().expect("output key"));
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
    collected
}

async fn wait_for_jobs(state: &ApiState, expected: usize) -> bool {
    for _ in 0..100 {
        if state.admission.current_jobs() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ---------------------------------------------------------------------------
// Origin checks
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_listed_origin_gets_welcome() {
    let server = start_test_server().await;
    let mut ws = connect(&server.base, Some(ORIGIN)).await.expect("connect");
    let text = read_until(&mut ws, "Available apps:").await;
    assert!(text.starts_with("Welcome to the Terminal Showcase!"));
    assert!(text.contains("testapp - Echo tester"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_unlisted_origin_rejected() {
    let server = start_test_server().await;
    let err = connect(&server.base, Some("http://evil.com"))
        .await
        .expect_err("unlisted origin must be rejected");
    assert!(err.contains("403"), "expected 403, got: {err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_missing_origin_rejected() {
    let server = start_test_server().await;
    let err = connect(&server.base, None)
        .await
        .expect_err("missing origin must be rejected");
    assert!(err.contains("403"), "expected 403, got: {err}");
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_testapp_round_trip() {
    let server = start_test_server().await;
    let mut ws = connect(&server.base, Some(ORIGIN)).await.expect("connect");
    read_until(&mut ws, "Available apps:").await;

    send(&mut ws, serde_json::json!({ "command": "testapp" })).await;
    assert!(read_until(&mut ws, "Running: testapp").await.contains("Running: testapp"));

    send(&mut ws, serde_json::json!({ "resize": { "rows": 40, "cols": 120 } })).await;
    send(&mut ws, serde_json::json!({ "input": "hello\n" })).await;
    let text = read_until(&mut ws, "You typed: hello").await;
    assert!(text.contains("You typed: hello"), "got {text:?}");

    send(&mut ws, serde_json::json!({ "input": "quit\r" })).await;
    let text = read_until(&mut ws, "[Process Completed. Press Enter to continue]").await;
    assert!(text.contains("[Process Completed"), "got {text:?}");
    assert!(wait_for_jobs(&server.state, 0).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_disconnect_releases_admission() {
    let server = start_test_server().await;
    let mut ws = connect(&server.base, Some(ORIGIN)).await.expect("connect");
    read_until(&mut ws, "Available apps:").await;

    send(&mut ws, serde_json::json!({ "command": "testapp" })).await;
    read_until(&mut ws, "Running: testapp").await;
    assert_eq!(server.state.admission.current_jobs(), 1);

    ws.close(None).await.expect("close");
    drop(ws);
    assert!(wait_for_jobs(&server.state, 0).await);

    // The slot is free for the next client.
    let mut ws = connect(&server.base, Some(ORIGIN)).await.expect("reconnect");
    read_until(&mut ws, "Available apps:").await;
    send(&mut ws, serde_json::json!({ "command": "testapp" })).await;
    assert!(read_until(&mut ws, "Running: testapp").await.contains("Running: testapp"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ws_non_json_closes_session() {
    let server = start_test_server().await;
    let mut ws = connect(&server.base, Some(ORIGIN)).await.expect("connect");
    read_until(&mut ws, "Available apps:").await;

    send(&mut ws, serde_json::json!({ "command": "testapp" })).await;
    read_until(&mut ws, "Running: testapp").await;

    ws.send(Message::Text("definitely not json".into()))
        .await
        .expect("send");
    assert!(wait_for_jobs(&server.state, 0).await);
}

// ---------------------------------------------------------------------------
// Info endpoints
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn test_apps_endpoint_over_http() {
    let server = start_test_server().await;
    let body: serde_json::Value = reqwest::get(format!("{}/apps", server.base))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body["apps"]["testapp"], "Echo tester");
    assert_eq!(body["max_concurrent"], 1);
}
