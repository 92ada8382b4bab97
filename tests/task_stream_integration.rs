//! Integration tests for the task stream WebSocket + health endpoint.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite, and plays the orchestrator side of the stream.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use wep::builtin::register_builtin_handlers;
use wep::config::WorkerConfig;
use wep::executor::Executor;
use wep::protocol::{TaskKey, TaskResult};
use wep::registry::HandlerRegistry;
use wep::server::{self, AppState};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    port: u16,
    shutdown: CancellationToken,
    executor: Arc<Executor>,
}

/// Start a worker on a random port with the given handlers.
async fn start_server(registry: HandlerRegistry, drain_grace: Duration) -> TestServer {
    let config = WorkerConfig {
        worker_id: "wep-test".to_string(),
        tags: vec!["test".to_string()],
        max_concurrency: 2,
        drain_grace,
        ..WorkerConfig::default()
    };
    let executor = Arc::new(Executor::new(Arc::new(registry), config.max_concurrency));
    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::clone(&executor), &config, shutdown.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        server::serve(listener, state).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        port,
        shutdown,
        executor,
    }
}

/// Connect and consume the hello + capabilities greeting.
async fn connect(port: u16) -> Client {
    let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    assert_eq!(next_json(&mut ws).await.unwrap()["type"], "hello");
    assert_eq!(next_json(&mut ws).await.unwrap()["type"], "capabilities");
    ws
}

/// Next JSON frame from the server, or `None` once the stream is closed.
async fn next_json(ws: &mut Client) -> Option<Value> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(txt))) => {
                return Some(serde_json::from_str(&txt).expect("invalid JSON from server"));
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn assign(activity_id: &str, kind: &str, version: &str) -> Value {
    json!({
        "type": "assign",
        "activity_id": activity_id,
        "run_id": format!("{activity_id}-run"),
        "task_kind": kind,
        "task_version": version,
    })
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_greeting() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(HandlerRegistry::new(), Duration::from_secs(1)).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", server.port))
            .await
            .unwrap();

        let hello = next_json(&mut ws).await.unwrap();
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["worker_id"], "wep-test");

        let caps = next_json(&mut ws).await.unwrap();
        assert_eq!(caps["type"], "capabilities");
        assert_eq!(caps["max_concurrency"], 2);
        assert_eq!(caps["tags"], json!(["test"]));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_preprocess_assignment_completes() {
    timeout(TEST_TIMEOUT, async {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        let server = start_server(registry, Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        let mut msg = assign("a1", "video.preprocess", "1.0.0");
        msg["workflow_instance_id"] = json!("wf-1");
        msg["upload_prefix"] = json!("s3://bucket/wf-1");
        msg["inputs"] = json!([{"name": "source", "media_type": "video/mp4", "ref": "s3://in.mp4"}]);
        send_json(&mut ws, msg).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["type"], "completion");
        assert_eq!(completion["activity_id"], "a1");
        assert_eq!(completion["run_id"], "a1-run");
        assert_eq!(completion["status"], "SUCCESS");
        assert_eq!(completion["result_ref"], "s3://bucket/wf-1/preprocess/result.json");
        assert!(completion.get("error").is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_unknown_task_reports_error() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(HandlerRegistry::new(), Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        send_json(&mut ws, assign("a2", "unknown.kind", "1")).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["type"], "completion");
        assert_eq!(completion["activity_id"], "a2");
        assert_eq!(completion["status"], "ERROR");
        assert!(
            completion["error"]
                .as_str()
                .unwrap()
                .contains("No handler for unknown.kind:1")
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_missing_required_input_skips_handler() {
    timeout(TEST_TIMEOUT, async {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"kind": "video.preprocess", "version": "1.1.0", "spec": {{"inputs": [{{"name": "source"}}]}}}}]"#
        )
        .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_fn(TaskKey::new("video.preprocess", "1.1.0"), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskResult::reference("never"))
        });
        registry.bind_specifications_from_file(file.path()).unwrap();

        let server = start_server(registry, Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        send_json(&mut ws, assign("a3", "video.preprocess", "1.1.0")).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["status"], "ERROR");
        let error = completion["error"].as_str().unwrap();
        assert!(error.contains("Missing required inputs"));
        assert!(error.contains("source"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_echo_returns_inline_bytes() {
    timeout(TEST_TIMEOUT, async {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        let server = start_server(registry, Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        let mut msg = assign("a4", "builtin.echo", "1.0.0");
        msg["inputs"] = json!([
            {"name": "blob", "media_type": "application/octet-stream", "inline_bytes": "AAEC"}
        ]);
        send_json(&mut ws, msg).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["status"], "SUCCESS");
        assert_eq!(completion["result_inline"], "AAEC");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_unknown_message_type_is_skipped() {
    timeout(TEST_TIMEOUT, async {
        let mut registry = HandlerRegistry::new();
        registry.register_fn(TaskKey::new("k", "1"), |_, _| Ok(TaskResult::reference("ok")));
        let server = start_server(registry, Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        send_json(&mut ws, json!({"type": "mystery"})).await;
        send_json(&mut ws, assign("a5", "k", "1")).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["activity_id"], "a5");
        assert_eq!(completion["status"], "SUCCESS");
        assert_eq!(completion["result_ref"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_malformed_assignment_reports_error() {
    timeout(TEST_TIMEOUT, async {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        let counter = Arc::clone(&calls);
        registry.register_fn(TaskKey::new("k", "1"), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskResult::reference("ok"))
        });
        let server = start_server(registry, Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        let mut msg = assign("a7", "k", "1");
        msg["inputs"] = json!([{"name": "src", "ref": "s3://x", "inline_json": "{}"}]);
        send_json(&mut ws, msg).await;

        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["type"], "completion");
        assert_eq!(completion["activity_id"], "a7");
        assert_eq!(completion["run_id"], "a7-run");
        assert_eq!(completion["status"], "ERROR");
        assert!(
            completion["error"]
                .as_str()
                .unwrap()
                .starts_with("Invalid assignment")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The stream stays usable.
        send_json(&mut ws, assign("a8", "k", "1")).await;
        let completion = next_json(&mut ws).await.unwrap();
        assert_eq!(completion["activity_id"], "a8");
        assert_eq!(completion["status"], "SUCCESS");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_non_json_frame_closes_stream() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server(HandlerRegistry::new(), Duration::from_secs(1)).await;
        let mut ws = connect(server.port).await;

        ws.send(Message::Text("not json".into())).await.unwrap();

        assert!(next_json(&mut ws).await.is_none());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn shutdown_abandons_stuck_work_without_completion() {
    let release = Arc::new(AtomicBool::new(false));

    let result = timeout(TEST_TIMEOUT, {
        let release = Arc::clone(&release);
        async move {
            let mut registry = HandlerRegistry::new();
            let flag = Arc::clone(&release);
            // Ignores cancellation; only the test can let it go.
            registry.register_fn(TaskKey::new("stuck", "1"), move |_, _| {
                while !flag.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(TaskResult::reference("late"))
            });
            let server = start_server(registry, Duration::from_millis(200)).await;
            let mut ws = connect(server.port).await;

            send_json(&mut ws, assign("a6", "stuck", "1")).await;
            while server.executor.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            server.shutdown.cancel();

            // Stream ends without a completion for the abandoned activity.
            while let Some(frame) = next_json(&mut ws).await {
                assert_ne!(frame["type"], "completion", "abandoned work reported: {frame}");
            }
        }
    })
    .await;

    release.store(true, Ordering::SeqCst);
    result.expect("test timed out");
}

// ── REST Endpoint Tests ──────────────────────────────────────────────

#[tokio::test]
async fn rest_health_endpoint() {
    timeout(TEST_TIMEOUT, async {
        let mut registry = HandlerRegistry::new();
        register_builtin_handlers(&mut registry);
        let server = start_server(registry, Duration::from_secs(1)).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "wep");
        assert_eq!(body["max_concurrency"], 2);
        assert_eq!(body["in_flight"], 0);
        assert_eq!(body["available_slots"], 2);
        assert_eq!(
            body["handlers"],
            json!(["builtin.echo:1.0.0", "video.preprocess:1.0.0"])
        );
    })
    .await
    .expect("test timed out");
}
