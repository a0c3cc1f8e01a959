//! End-to-end tests: real WebSocket clients against servers sharing a store.

use futures_util::{SinkExt, StreamExt};
use herald_core::{Collaborators, Gateway, JwtVerifier, MemoryStore};
use herald_protocol::{codec, ClientEvent, OutboundEvent, UserStatus};
use herald_server::config::Config;
use herald_server::handlers::{self, AppState};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

const SECRET: &[u8] = b"e2e-secret";
const WAIT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: u64,
}

fn token(user: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    encode(
        &Header::default(),
        &Claims { sub: user, exp },
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

struct Node {
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.gateway.shutdown();
    }
}

async fn spawn_node(store: Arc<MemoryStore>) -> Node {
    let config = Config::default();
    let collaborators = Collaborators::new(Arc::new(JwtVerifier::hs256(SECRET)));
    let gateway = Arc::new(Gateway::new(store, collaborators, config.gateway_settings()));
    gateway.start().await.unwrap();

    let listener = handlers::bind_listener("127.0.0.1:0".parse().unwrap(), false).unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(gateway.clone(), config, shutdown.clone()));
    tokio::spawn(handlers::serve(listener, state));

    Node {
        addr,
        gateway,
        shutdown,
    }
}

async fn connect(node: &Node, user: &str) -> Client {
    let url = format!("ws://{}/ws?token={}", node.addr, token(user));
    let (mut client, _) = connect_async(url).await.unwrap();
    let connected = next_event(&mut client, "connected").await;
    assert_eq!(connected["user_id"], user);
    client
}

async fn send(client: &mut Client, event: Value) {
    client.send(Message::Text(event.to_string())).await.unwrap();
}

/// Read the next JSON event.
async fn next_any(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("Timed out waiting for an event")
            .expect("Connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Read until an event named `name` arrives and return its data.
async fn next_event(client: &mut Client, name: &str) -> Value {
    loop {
        let value = next_any(client).await;
        if value["event"] == name {
            return value["data"].clone();
        }
    }
}

/// Read MessagePack events until one named `name` arrives.
async fn next_binary_event(client: &mut Client, name: &str) -> OutboundEvent {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("Timed out waiting for an event")
            .expect("Connection closed")
            .unwrap();
        if let Message::Binary(data) = message {
            let event: OutboundEvent = codec::decode(&data).unwrap();
            if event.event == name {
                return event;
            }
        }
    }
}

/// Count events named `name` arriving within `window`.
async fn count_events(client: &mut Client, name: &str, window: Duration) -> usize {
    let mut count = 0;
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(Ok(message))) = tokio::time::timeout_at(deadline, client.next()).await {
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["event"] == name {
                count += 1;
            }
        }
    }
    count
}

async fn join(client: &mut Client, channel: &str) {
    send(client, json!({"event": "join_channel", "data": {"channel_id": channel}})).await;
    let ack = next_event(client, "channel_joined").await;
    assert_eq!(ack["channel_id"], channel);
}

#[tokio::test]
async fn test_rejects_missing_token() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;

    match connect_async(format!("ws://{}/ws", node.addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("Expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }

    match connect_async(format!("ws://{}/ws?token=garbage", node.addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::UNAUTHORIZED),
        other => panic!("Expected 401, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert_eq!(node.gateway.registry().session_count(), 0);
}

#[tokio::test]
async fn test_rejects_incompatible_version() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;

    let url = format!("ws://{}/ws?v=2.0&token={}", node.addr, token("alice"));
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
        other => panic!("Expected 400, got {:?}", other.map(|(_, r)| r.status())),
    }

    let url = format!("ws://{}/ws?v=1.3&token={}", node.addr, token("alice"));
    assert!(connect_async(url).await.is_ok());
}

#[tokio::test]
async fn test_bearer_header() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;

    let mut request = format!("ws://{}/ws", node.addr).into_client_request().unwrap();
    let bearer = HeaderValue::from_str(&format!("Bearer {}", token("alice"))).unwrap();
    request.headers_mut().insert(header::AUTHORIZATION, bearer);

    let (mut client, _) = connect_async(request).await.unwrap();
    let connected = next_event(&mut client, "connected").await;
    assert_eq!(connected["user_id"], "alice");
    assert_eq!(connected["version"], "1.0");
}

#[tokio::test]
async fn test_cross_process_channel_broadcast() {
    let store = Arc::new(MemoryStore::new());
    let node_a = spawn_node(store.clone()).await;
    let node_b = spawn_node(store).await;

    let mut alice = connect(&node_a, "alice").await;
    let mut bob = connect(&node_b, "bob").await;
    let mut carol = connect(&node_b, "carol").await;

    join(&mut alice, "7").await;
    join(&mut bob, "7").await;
    let joined = next_event(&mut alice, "user_joined").await;
    assert_eq!(joined["user_id"], "bob");
    assert_eq!(node_a.gateway.channel_users_count("7").await, 2);

    let message = json!({"channel_id": "7", "content": "hello", "client_ref": "c1"});
    send(&mut alice, json!({"event": "send_message", "data": message})).await;

    let sent = next_event(&mut alice, "message_sent").await;
    assert_eq!(sent["client_ref"], "c1");
    assert_eq!(sent["message"]["persisted"], true);

    let on_a = next_event(&mut alice, "new_message").await;
    let on_b = next_event(&mut bob, "new_message").await;
    assert_eq!(on_a, on_b);
    assert_eq!(on_b["content"], "hello");
    assert_eq!(on_b["sender_id"], "alice");
    assert_eq!(on_b["id"], sent["message"]["id"]);

    // Exactly once, and never to a session outside the channel.
    let window = Duration::from_millis(300);
    assert_eq!(count_events(&mut alice, "new_message", window).await, 0);
    assert_eq!(count_events(&mut bob, "new_message", window).await, 0);
    assert_eq!(count_events(&mut carol, "new_message", window).await, 0);
}

#[tokio::test]
async fn test_disconnect_announces_user_left() {
    let store = Arc::new(MemoryStore::new());
    let node_a = spawn_node(store.clone()).await;
    let node_b = spawn_node(store).await;

    let mut alice = connect(&node_a, "alice").await;
    let mut bob = connect(&node_b, "bob").await;
    join(&mut alice, "7").await;
    join(&mut bob, "7").await;

    bob.close(None).await.unwrap();

    // Channel and global announcements travel separately; accept either order.
    let (mut left, mut offline) = (None, None);
    while left.is_none() || offline.is_none() {
        let event = next_any(&mut alice).await;
        let data = &event["data"];
        match event["event"].as_str() {
            Some("user_left") => left = Some(data.clone()),
            Some("user_status_changed") if data["status"] == "offline" => {
                offline = Some(data.clone());
            }
            _ => {}
        }
    }
    let left = left.unwrap();
    assert_eq!(left["channel_id"], "7");
    assert_eq!(left["user_id"], "bob");
    assert_eq!(offline.unwrap()["user_id"], "bob");

    assert_eq!(node_a.gateway.channel_users_count("7").await, 1);
    let record = node_a.gateway.presence().lookup("bob").await.unwrap();
    assert_eq!(record.status, UserStatus::Offline);
    assert_eq!(node_b.gateway.registry().session_count(), 0);
}

#[tokio::test]
async fn test_typing_excludes_sender() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(&node, "alice").await;
    let mut bob = connect(&node, "bob").await;
    join(&mut alice, "7").await;
    join(&mut bob, "7").await;

    send(&mut alice, json!({"event": "start_typing", "data": {"channel_id": "7"}})).await;
    let typing = next_event(&mut bob, "user_typing").await;
    assert_eq!(typing["user_id"], "alice");
    assert_eq!(
        count_events(&mut alice, "user_typing", Duration::from_millis(200)).await,
        0
    );
}

#[tokio::test]
async fn test_msgpack_encoding() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;
    let url = format!("ws://{}/ws?encoding=msgpack&token={}", node.addr, token("alice"));
    let (mut client, _) = connect_async(url).await.unwrap();

    let connected = next_binary_event(&mut client, "connected").await;
    assert_eq!(connected.data["user_id"], "alice");
    // The user's own online announcement is queued between `connected` and `pong`.
    let online = next_binary_event(&mut client, "user_status_changed").await;
    assert_eq!(online.data["status"], "online");

    let ping = codec::encode(&ClientEvent::Ping { timestamp: Some(7) }).unwrap();
    client.send(Message::Binary(ping.to_vec())).await.unwrap();
    let pong = next_binary_event(&mut client, "pong").await;
    assert_eq!(pong.data["timestamp"], 7);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;
    let mut alice = connect(&node, "alice").await;

    alice.send(Message::Text("not json".into())).await.unwrap();
    let error = next_event(&mut alice, "error").await;
    assert_eq!(error["code"], "malformed");

    send(&mut alice, json!({"event": "send_message", "data": {"channel_id": "9", "content": "x"}}))
        .await;
    let error = next_event(&mut alice, "error").await;
    assert_eq!(error["code"], "forbidden");

    send(&mut alice, json!({"event": "ping", "data": {"timestamp": 1}})).await;
    let pong = next_event(&mut alice, "pong").await;
    assert_eq!(pong["timestamp"], 1);
}

#[tokio::test]
async fn test_health_endpoint() {
    let node = spawn_node(Arc::new(MemoryStore::new())).await;
    let _alice = connect(&node, "alice").await;

    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
    assert!(response.contains(r#""connections":1"#));
}
