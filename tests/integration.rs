//! Integration tests for the sync bridge
//!
//! Each test starts a full service against the stub host provider,
//! connects real WebSocket clients and validates the protocol flows:
//! discovery, handshake, echo, task control, streaming replication,
//! capacity enforcement and heartbeat timeout.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use visionsync::config::{Config, HeartbeatConfig, SyncConfig};
use visionsync::host::stub::StubProvider;
use visionsync::host::MessageAction;
use visionsync::host::TaskMessage;
use visionsync::service::{SyncEvent, SyncService};

// Atomic port counter to avoid port conflicts between tests
static PORT_COUNTER: AtomicU16 = AtomicU16::new(21000);

fn next_ports() -> (u16, u16) {
    let base = PORT_COUNTER.fetch_add(25, Ordering::SeqCst);
    (base, base + 12)
}

fn test_config(ws_port: u16, discovery_port: u16, max_connections: usize) -> Config {
    Config {
        sync: SyncConfig {
            enabled: true,
            port: ws_port,
            discovery_port,
            service_name: "RooCode-test".to_string(),
            max_connections,
            consecutive_mistake_limit: None,
        },
        // Generous defaults so slow test runners never trip the
        // heartbeat; the timeout scenario shrinks these itself
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(10),
            grace: Duration::from_secs(5),
        },
        ..Config::default()
    }
}

async fn start_service(
    max_connections: usize,
) -> (Arc<SyncService>, Arc<StubProvider>, u16, u16) {
    start_with_config(|_| {}, max_connections).await
}

async fn start_with_config(
    adjust: impl FnOnce(&mut Config),
    max_connections: usize,
) -> (Arc<SyncService>, Arc<StubProvider>, u16, u16) {
    let (ws_port, discovery_port) = next_ports();
    let mut config = test_config(ws_port, discovery_port, max_connections);
    adjust(&mut config);
    let service = Arc::new(SyncService::new(config));
    let provider = StubProvider::new();
    service
        .start(provider.clone())
        .await
        .expect("service start");
    let status = service.status().await;
    (
        service,
        provider,
        status.websocket_port.unwrap(),
        status.discovery_port.unwrap(),
    )
}

/// Helper for WebSocket client operations in tests
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let url = format!("ws://127.0.0.1:{}", port);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("client connect");
        Self { ws }
    }

    async fn send(&mut self, frame: &Value) {
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .expect("client send");
    }

    /// Next text frame as JSON, skipping control frames
    async fn recv(&mut self) -> Value {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("frame within 5s")
                .expect("stream open")
                .expect("frame ok");
            match frame {
                Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    /// Next frame of a given type, skipping others
    async fn recv_type(&mut self, message_type: &str) -> Value {
        for _ in 0..20 {
            let frame = self.recv().await;
            if frame["type"] == message_type {
                return frame;
            }
        }
        panic!("no {} frame within 20 messages", message_type);
    }

    async fn handshake(&mut self) -> Value {
        self.send(&json!({
            "type": "ClientHandshake",
            "clientType": "visionOS",
            "version": "1.0.0",
            "capabilities": [],
        }))
        .await;
        let accepted = self.recv().await;
        assert_eq!(accepted["type"], "ConnectionAccepted");
        accepted
    }

    /// Wait until the socket reports closed
    async fn expect_close(&mut self) {
        let deadline = Duration::from_secs(5);
        loop {
            match timeout(deadline, self.ws.next()).await.expect("close within 5s") {
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return,
            }
        }
    }
}

/// Minimal HTTP GET against the discovery endpoint
async fn http_get(port: u16, path: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("discovery connect");
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read");
    let response = String::from_utf8_lossy(&response).to_string();

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let body_start = response.find("\r\n\r\n").expect("header terminator") + 4;
    let body = response[body_start..].trim();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body).expect("JSON body")
    };
    (status, json)
}

// ============================================================================
// Scenario 1: discovery -> handshake -> echo
// ============================================================================

#[tokio::test]
async fn discovery_handshake_echo() {
    let (service, _provider, ws_port, discovery_port) = start_service(10).await;

    let (status, health) = http_get(discovery_port, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["service"], "RooCode-test");

    let (status, discover) = http_get(discovery_port, "/discover").await;
    if status == 200 {
        let url = discover["websocket_url"].as_str().expect("websocket_url");
        assert!(url.starts_with("ws://"));
        assert!(url.ends_with(&format!(":{}", ws_port)));
        assert_eq!(discover["name"], "RooCode-test");
        assert_eq!(discover["app"], "Roo Code");
        assert!(discover["capabilities"]
            .as_array()
            .unwrap()
            .contains(&json!("ai_conversation")));
    } else {
        // Machines without a non-loopback interface report 500
        assert_eq!(status, 500);
        assert_eq!(discover["error"], "Network unavailable");
    }

    let (status, index) = http_get(discovery_port, "/").await;
    assert_eq!(status, 200);
    assert_eq!(index["websocket_port"], ws_port);

    let (status, missing) = http_get(discovery_port, "/nope").await;
    assert_eq!(status, 404);
    assert_eq!(missing["error"], "Not found");
    assert_eq!(missing["path"], "/nope");

    let mut client = TestClient::connect(ws_port).await;
    let accepted = client.handshake().await;
    assert!(!accepted["payload"]["connectionId"]
        .as_str()
        .unwrap()
        .is_empty());
    assert_eq!(accepted["payload"]["serverInfo"]["name"], "Roo Code");

    client
        .send(&json!({ "type": "Echo", "payload": { "message": "hi" } }))
        .await;
    let echo = client.recv().await;
    assert_eq!(echo["type"], "Echo");
    assert_eq!(echo["payload"]["message"], "hi");

    service.stop().await;
}

// ============================================================================
// Scenario 2: user message creates a task
// ============================================================================

#[tokio::test]
async fn user_message_creates_task() {
    let (service, provider, ws_port, _) = start_service(10).await;

    let mut client = TestClient::connect(ws_port).await;
    client.handshake().await;

    client
        .send(&json!({
            "type": "AIConversation",
            "payload": { "sessionId": "s1", "role": "user", "content": "hello" },
        }))
        .await;

    let ack = client.recv_type("AIConversation").await;
    assert_eq!(ack["payload"]["role"], "assistant");
    assert_eq!(ack["payload"]["metadata"]["type"], "task_created");
    assert!(!ack["payload"]["metadata"]["taskId"]
        .as_str()
        .unwrap()
        .is_empty());

    let calls = provider.create_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].text, "hello");
    assert!(calls[0].images.is_empty());

    service.stop().await;
}

// ============================================================================
// Scenario 3: streaming replication
// ============================================================================

#[tokio::test]
async fn streaming_replication() {
    let (service, provider, ws_port, _) = start_service(10).await;

    let mut client = TestClient::connect(ws_port).await;
    client.handshake().await;

    // Register with the bridge (creates the task this client drives)
    client
        .send(&json!({
            "type": "AIConversation",
            "payload": { "sessionId": "s1", "role": "user", "content": "start" },
        }))
        .await;
    client.recv_type("AIConversation").await;

    // Give the bridge a beat to attach its task listener
    tokio::time::sleep(Duration::from_millis(100)).await;
    let task = provider.current_stub().expect("task created");

    for (text, partial) in [("Hel", true), ("Hello", true), ("Hello.", false)] {
        let mut message = TaskMessage::say(1712, "text", text, false);
        message.id = Some("k".to_string());
        message.partial = partial;
        task.emit(MessageAction::Updated, message);
    }

    let mut finals = Vec::new();
    while finals.len() < 3 {
        let frame = client.recv_type("AIConversation").await;
        if frame["streamId"] == "k" {
            finals.push(frame["isFinal"].as_bool().unwrap());
        }
    }
    assert_eq!(finals, vec![false, false, true]);

    service.stop().await;
}

// ============================================================================
// Scenario 4: ask round-trip
// ============================================================================

#[tokio::test]
async fn ask_round_trip() {
    let (service, provider, ws_port, _) = start_service(10).await;

    let mut client = TestClient::connect(ws_port).await;
    client.handshake().await;

    client
        .send(&json!({
            "type": "AIConversation",
            "payload": { "sessionId": "s1", "role": "user", "content": "start" },
        }))
        .await;
    client.recv_type("AIConversation").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let task = provider.current_stub().expect("task created");
    task.emit(
        MessageAction::Created,
        TaskMessage::ask(1712000000000, "followup", "Proceed?"),
    );

    let ask = client.recv_type("AIConversation").await;
    assert_eq!(ask["payload"]["role"], "user");
    assert_eq!(ask["payload"]["content"], "Proceed?");
    assert_eq!(ask["payload"]["metadata"]["messageId"], 1712000000000u64);

    client
        .send(&json!({
            "type": "AskResponse",
            "payload": { "sessionId": "s1", "askResponse": "yesButtonClicked" },
        }))
        .await;
    let ack = client.recv_type("AIConversation").await;
    assert_eq!(ack["payload"]["metadata"]["type"], "ask_response_result");

    let asks = task.ask_calls();
    assert_eq!(asks.len(), 1);
    assert_eq!(asks[0].text, None);
    assert_eq!(asks[0].images, None);

    service.stop().await;
}

// ============================================================================
// Scenario 5: capacity
// ============================================================================

#[tokio::test]
async fn capacity_rejects_excess_connection() {
    let (service, _provider, ws_port, _) = start_service(1).await;

    let mut first = TestClient::connect(ws_port).await;
    first.handshake().await;

    let mut second = TestClient::connect(ws_port).await;
    let rejected = second.recv().await;
    assert_eq!(rejected["type"], "ConnectionRejected");
    assert_eq!(rejected["reason"], "Server at maximum capacity");
    second.expect_close().await;

    // The surviving client is unaffected
    first.send(&json!({ "type": "Ping" })).await;
    let pong = first.recv().await;
    assert_eq!(pong["type"], "Pong");

    service.stop().await;
}

// ============================================================================
// Scenario 6: heartbeat timeout
// ============================================================================

#[tokio::test]
async fn heartbeat_timeout_disconnects_silent_client() {
    let (service, provider, ws_port, _) = start_with_config(
        |config| {
            config.heartbeat = HeartbeatConfig {
                interval: Duration::from_secs(1),
                grace: Duration::from_millis(250),
            };
        },
        10,
    )
    .await;
    let mut events = service.subscribe();

    let mut client = TestClient::connect(ws_port).await;
    client.handshake().await;
    // Stop reading: the client never answers server PING frames
    let silent_since = std::time::Instant::now();

    let disconnect = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::ClientDisconnected { reason, .. }) => return reason,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await
    .expect("disconnect within 5s");
    assert_eq!(disconnect, "Ping timeout");

    // The drop lands at interval + grace past the last frame, well
    // before a second ping interval elapses
    let elapsed = silent_since.elapsed();
    assert!(
        elapsed >= Duration::from_millis(1100),
        "disconnected too early: {:?}",
        elapsed
    );
    assert!(
        elapsed < Duration::from_millis(1800),
        "disconnect overshot the deadline: {:?}",
        elapsed
    );

    // Exactly one disconnect
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SyncEvent::ClientDisconnected { .. }));
    }

    // Host UI saw the empty connection list
    let last = provider.status_pushes().pop().expect("status pushed");
    assert!(last.connections.is_empty());

    service.stop().await;
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn unknown_type_does_not_disconnect() {
    let (service, _provider, ws_port, _) = start_service(10).await;

    let mut client = TestClient::connect(ws_port).await;
    client.handshake().await;

    client.send(&json!({ "type": "Gossip", "payload": {} })).await;
    client.send(&json!({ "type": "Ping" })).await;
    let pong = client.recv().await;
    assert_eq!(pong["type"], "Pong");

    service.stop().await;
}

#[tokio::test]
async fn unknown_client_type_is_accepted() {
    let (service, _provider, ws_port, _) = start_service(10).await;

    let mut client = TestClient::connect(ws_port).await;
    client
        .send(&json!({
            "type": "ClientHandshake",
            "clientType": "androidXR",
            "version": "0.1",
            "capabilities": [],
        }))
        .await;
    let accepted = client.recv().await;
    assert_eq!(accepted["type"], "ConnectionAccepted");

    let status = service.status().await;
    assert_eq!(status.connected_clients.len(), 1);
    assert_eq!(status.connected_clients[0].client_type, "androidXR");

    service.stop().await;
}

#[tokio::test]
async fn second_start_fails_and_stop_is_idempotent() {
    let (service, _provider, _, _) = start_service(10).await;

    let err = service
        .start(StubProvider::new())
        .await
        .expect_err("second start must fail");
    assert!(err.to_string().contains("already running"));

    service.stop().await;
    service.stop().await;

    let status = service.status().await;
    assert!(!status.running);
}

#[tokio::test]
async fn disabled_service_does_not_bind() {
    let (ws_port, discovery_port) = next_ports();
    let mut config = test_config(ws_port, discovery_port, 10);
    config.sync.enabled = false;

    let service = SyncService::new(config);
    service.start(StubProvider::new()).await.expect("no-op start");

    let status = service.status().await;
    assert!(!status.running);
    assert!(TcpStream::connect(("127.0.0.1", ws_port)).await.is_err());
}
