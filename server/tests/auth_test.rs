//! Integration tests for identity-token authentication.
//!
//! These tests verify that when a public key is configured:
//! - GET /ws rejects missing, forged and expired tokens with 401 before the
//!   upgrade
//! - A valid token's claims become the connection's identity
//! - Reconnecting with the same identity supersedes the earlier connection

use std::net::SocketAddr;
use std::time::Duration;

use base64::prelude::*;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use chatter_server::auth::{encode_token, IdentityClaims};
use chatter_server::config::Config;
use chatter_server::routes::{create_router, AppState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

/// Creates a signing key from a deterministic seed.
fn signing_key(seed: u8) -> SigningKey {
    let mut seed_bytes = [0u8; 32];
    for (i, byte) in seed_bytes.iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    SigningKey::from_bytes(&seed_bytes)
}

fn token_config(key: &SigningKey) -> Config {
    Config {
        port: 0,
        identity_public_key: Some(BASE64_STANDARD.encode(key.verifying_key().to_bytes())),
        avatar_dir: std::env::temp_dir().join(format!("chatter-none-{}", Uuid::new_v4())),
        ..Config::default()
    }
}

fn claims(id: &str, name: &str, exp: i64) -> IdentityClaims {
    IdentityClaims {
        id: id.to_string(),
        name: name.to_string(),
        avatar: format!("https://avatars.example/{id}.png"),
        exp,
    }
}

fn valid_token(key: &SigningKey, id: &str, name: &str) -> String {
    encode_token(key, &claims(id, name, Utc::now().timestamp() + 3600))
}

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

async fn try_connect(addr: SocketAddr, query: &str) -> Result<Client, tungstenite::Error> {
    timeout(RECV_TIMEOUT, connect_async(format!("ws://{addr}/ws{query}")))
        .await
        .expect("connect timed out")
        .map(|(client, _response)| client)
}

/// Asserts that the handshake was refused with `401 Unauthorized`.
fn assert_unauthorized(result: Result<Client, tungstenite::Error>) {
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 401);
        }
        Err(other) => panic!("expected HTTP 401, got {other}"),
        Ok(_) => panic!("expected HTTP 401, connection was accepted"),
    }
}

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

async fn members(addr: SocketAddr) -> Vec<Value> {
    let body: Value = reqwest::get(format!("http://{addr}/members"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["members"].as_array().unwrap().clone()
}

// ============================================================================
// Rejection Tests
// ============================================================================

#[tokio::test]
async fn ws_without_token_is_unauthorized() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    assert_unauthorized(try_connect(addr, "").await);
}

#[tokio::test]
async fn ws_with_forged_token_is_unauthorized() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    let forged = valid_token(&signing_key(99), "u-1", "Mallory");
    assert_unauthorized(try_connect(addr, &format!("?token={forged}")).await);
}

#[tokio::test]
async fn ws_with_expired_token_is_unauthorized() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    let expired = encode_token(&key, &claims("u-1", "Ada", Utc::now().timestamp() - 60));
    assert_unauthorized(try_connect(addr, &format!("?token={expired}")).await);
}

#[tokio::test]
async fn ws_with_garbage_token_is_unauthorized() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    assert_unauthorized(try_connect(addr, "?token=not-a-token").await);
}

#[tokio::test]
async fn rejected_connections_are_never_registered() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    assert_unauthorized(try_connect(addr, "").await);
    assert!(members(addr).await.is_empty());
}

// ============================================================================
// Accepted Connection Tests
// ============================================================================

#[tokio::test]
async fn valid_token_claims_become_the_identity() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    let token = valid_token(&key, "u-ada", "Ada");
    let mut client = try_connect(addr, &format!("?token={token}")).await.unwrap();

    let welcome = recv_json(&mut client).await;
    assert_eq!(welcome["type"], "initialize");
    assert_eq!(welcome["author"]["id"], "u-ada");
    assert_eq!(welcome["text"], serde_json::json!(["Welcome Ada!"]));

    let listed = timeout(RECV_TIMEOUT, async {
        loop {
            let listed = members(addr).await;
            if !listed.is_empty() {
                return listed;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "u-ada");
    assert_eq!(listed[0]["avatar"], "https://avatars.example/u-ada.png");
}

#[tokio::test]
async fn reconnecting_identity_supersedes_previous_connection() {
    let key = signing_key(1);
    let addr = spawn_test_server(token_config(&key)).await;

    let mut observer = try_connect(addr, &format!("?token={}", valid_token(&key, "u-obs", "Observer")))
        .await
        .unwrap();
    recv_json(&mut observer).await; // welcome

    let token = valid_token(&key, "u-ada", "Ada");
    let mut first = try_connect(addr, &format!("?token={token}")).await.unwrap();
    recv_json(&mut first).await; // welcome
    assert_eq!(
        recv_json(&mut observer).await["text"],
        serde_json::json!(["Ada has joined the conversation"])
    );

    let mut second = try_connect(addr, &format!("?token={token}")).await.unwrap();
    recv_json(&mut second).await; // welcome

    // The superseded stream is closed by the server.
    let closed = timeout(RECV_TIMEOUT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "superseded connection was not closed");

    // The observer sees a second join notice and no leave notice.
    assert_eq!(
        recv_json(&mut observer).await["text"],
        serde_json::json!(["Ada has joined the conversation"])
    );

    let listed = members(addr).await;
    let ids: Vec<&str> = listed.iter().map(|m| m["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["u-ada", "u-obs"]);

    // Messages from the new connection still flow.
    second.send(Message::text("still here")).await.unwrap();
    let chat = recv_json(&mut observer).await;
    assert_eq!(chat["author"]["id"], "u-ada");
    assert_eq!(chat["text"], serde_json::json!(["still here"]));
}
