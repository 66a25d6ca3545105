//! End-to-end chat tests over real WebSocket connections.
//!
//! A server is bound to `127.0.0.1:0` with guests enabled, and clients
//! connect with `tokio-tungstenite`. These tests cover the user-visible
//! behavior: welcome frames, fan-out that excludes the sender, and leave
//! notices.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use chatter_server::config::Config;
use chatter_server::routes::{create_router, AppState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for a frame that should arrive.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to watch for a frame that should not arrive.
const SILENCE_WINDOW: Duration = Duration::from_millis(200);

// ============================================================================
// Test Helpers
// ============================================================================

/// Creates a configuration that accepts guests from the built-in roster.
fn guest_config() -> Config {
    Config {
        port: 0,
        unsafe_no_auth: true,
        avatar_dir: std::env::temp_dir().join(format!("chatter-none-{}", Uuid::new_v4())),
        ..Config::default()
    }
}

/// Spawns a test server on a random available port.
async fn spawn_test_server(config: Config) -> SocketAddr {
    let (state, tasks) = AppState::new(config).unwrap();
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        tasks.shutdown().await;
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = timeout(RECV_TIMEOUT, connect_async(format!("ws://{addr}/ws")))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    client
}

/// Receives the next JSON text frame, skipping control frames.
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

/// Asserts that no text frame arrives within the silence window.
async fn assert_silent(client: &mut Client) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(SILENCE_WINDOW, client.next()).await {
        panic!("expected silence, got {}", text.as_str());
    }
}

async fn member_count(addr: SocketAddr) -> usize {
    let body: Value = reqwest::get(format!("http://{addr}/members"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["members"].as_array().unwrap().len()
}

/// Waits until the hub reports `expected` members.
async fn wait_for_members(addr: SocketAddr, expected: usize) {
    timeout(RECV_TIMEOUT, async {
        while member_count(addr).await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("member count never reached {expected}"));
}

/// Connects a guest and returns it with the name from its welcome frame.
async fn join(addr: SocketAddr, expected_members: usize) -> (Client, String, String) {
    let mut client = connect(addr).await;
    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "initialize");

    let id = welcome["author"]["id"].as_str().unwrap().to_string();
    let name = welcome["author"]["name"].as_str().unwrap().to_string();
    assert_eq!(welcome["text"], serde_json::json!([format!("Welcome {name}!")]));

    wait_for_members(addr, expected_members).await;
    (client, id, name)
}

fn text_of(message: &Value) -> &str {
    message["text"][0].as_str().unwrap()
}

// ============================================================================
// Chat Tests
// ============================================================================

#[tokio::test]
async fn chat_fans_out_to_everyone_but_the_sender() {
    let addr = spawn_test_server(guest_config()).await;

    let (mut a, a_id, a_name) = join(addr, 1).await;
    let (mut b, _b_id, b_name) = join(addr, 2).await;
    assert_eq!(text_of(&recv_json(&mut a).await), format!("{b_name} has joined the conversation"));

    let (mut c, _c_id, c_name) = join(addr, 3).await;
    let joined = format!("{c_name} has joined the conversation");
    assert_eq!(text_of(&recv_json(&mut a).await), joined);
    assert_eq!(text_of(&recv_json(&mut b).await), joined);

    a.send(Message::text("hi")).await.unwrap();

    for client in [&mut b, &mut c] {
        let chat = recv_json(client).await;
        assert_eq!(chat["type"], "message");
        assert_eq!(chat["author"]["id"], a_id.as_str());
        assert_eq!(chat["author"]["name"], a_name.as_str());
        assert_eq!(chat["text"], serde_json::json!(["hi"]));
    }
    assert_silent(&mut a).await;

    b.close(None).await.unwrap();
    drop(b);

    let left = format!("{b_name} has left the conversation");
    for client in [&mut a, &mut c] {
        let notice = recv_json(client).await;
        assert_eq!(notice["type"], "system");
        assert_eq!(notice["author"]["name"], "system");
        assert_eq!(text_of(&notice), left);
    }
    wait_for_members(addr, 2).await;
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let addr = spawn_test_server(guest_config()).await;

    let (mut a, _, _) = join(addr, 1).await;
    let (mut b, _, _) = join(addr, 2).await;
    recv_json(&mut a).await; // b joined

    for i in 0..10 {
        a.send(Message::text(format!("msg-{i}"))).await.unwrap();
    }

    for i in 0..10 {
        assert_eq!(text_of(&recv_json(&mut b).await), format!("msg-{i}"));
    }
}

#[tokio::test]
async fn binary_frames_are_accepted_only_as_utf8() {
    let addr = spawn_test_server(guest_config()).await;

    let (mut a, _, _) = join(addr, 1).await;
    let (mut b, _, _) = join(addr, 2).await;
    recv_json(&mut a).await; // b joined

    a.send(Message::binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
    a.send(Message::binary(b"utf8 bytes".to_vec())).await.unwrap();

    assert_eq!(text_of(&recv_json(&mut b).await), "utf8 bytes");
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn dropped_connection_is_announced() {
    let addr = spawn_test_server(guest_config()).await;

    let (mut a, _, _) = join(addr, 1).await;
    let (b, _, b_name) = join(addr, 2).await;
    recv_json(&mut a).await; // b joined

    // No close frame: the TCP stream just goes away.
    drop(b);

    let notice = recv_json(&mut a).await;
    assert_eq!(text_of(&notice), format!("{b_name} has left the conversation"));
    wait_for_members(addr, 1).await;
}

// ============================================================================
// HTTP Surface Tests
// ============================================================================

#[tokio::test]
async fn health_reports_live_connections() {
    let addr = spawn_test_server(guest_config()).await;
    let (_a, _, _) = join(addr, 1).await;
    let (_b, _, _) = join(addr, 2).await;

    let health: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 2);
}

#[tokio::test]
async fn history_records_chat_but_not_notices() {
    let addr = spawn_test_server(guest_config()).await;

    let (mut a, a_id, _) = join(addr, 1).await;
    let (_b, _, _) = join(addr, 2).await;
    recv_json(&mut a).await; // b joined

    a.send(Message::text("for the record")).await.unwrap();

    let messages = timeout(RECV_TIMEOUT, async {
        loop {
            let body: Value = reqwest::get(format!("http://{addr}/messages"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            let messages = body["messages"].as_array().unwrap().clone();
            if !messages.is_empty() {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("message never reached history");

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["author"]["id"], a_id.as_str());
    assert_eq!(text_of(&messages[0]), "for the record");
}
