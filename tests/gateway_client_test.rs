//! End-to-end client tests against an in-process mock gateway.
//!
//! The mock does what the real gateway does on the wire: pushes a
//! `connect.challenge`, verifies the device signature on `connect`, answers
//! requests by id, and pushes events.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use carabiner::client::{ClientConfig, ConnectionStatus, GatewayClient, GatewayError};
use carabiner::identity::{ConnectInfo, DeviceConnect, IdentityStore};
use carabiner::store::StateStore;

type ServerWs = WebSocketStream<TcpStream>;

async fn send_event(ws: &mut ServerWs, event: &str, payload: Value) {
    let frame = json!({"type": "event", "event": event, "payload": payload});
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn send_ok(ws: &mut ServerWs, id: &str, payload: Value) {
    let frame = json!({"type": "res", "id": id, "ok": true, "payload": payload});
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();
}

async fn read_request(ws: &mut ServerWs) -> Value {
    while let Some(message) = ws.next().await {
        if let Message::Text(text) = message.unwrap() {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == json!("req") {
                return frame;
            }
        }
    }
    panic!("connection closed before a request arrived");
}

async fn server_handshake(ws: &mut ServerWs, nonce: &str, hello_payload: Value) -> Value {
    send_event(ws, "connect.challenge", json!({"nonce": nonce, "ts": 1})).await;
    let connect = read_request(ws).await;
    assert_eq!(connect["method"], json!("connect"));
    send_ok(ws, connect["id"].as_str().unwrap(), hello_payload).await;
    connect
}

/// Verify the device block exactly the way the gateway does: the device id
/// must be the SHA-256 of the submitted key, and the v2 payload signature
/// must check out against that key.
fn verify_connect_signature(params: &Value, nonce: &str) {
    let device = &params["device"];
    assert_eq!(device["nonce"], json!(nonce));

    let key_bytes: [u8; 32] = URL_SAFE_NO_PAD
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(
        device["id"],
        json!(hex::encode(Sha256::digest(key_bytes)))
    );

    let scopes = params["scopes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|scope| scope.as_str().unwrap())
        .collect::<Vec<_>>()
        .join(",");
    let payload = format!(
        "v2|{}|{}|{}|{}|{}|{}||{}",
        device["id"].as_str().unwrap(),
        params["client"]["id"].as_str().unwrap(),
        params["client"]["mode"].as_str().unwrap(),
        params["role"].as_str().unwrap(),
        scopes,
        device["signedAt"].as_u64().unwrap(),
        device["nonce"].as_str().unwrap(),
    );

    let verifying = VerifyingKey::from_bytes(&key_bytes).unwrap();
    let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(device["signature"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    verifying
        .verify_strict(payload.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .unwrap();
}

fn test_client(dir: &TempDir, url: String) -> (GatewayClient, IdentityStore) {
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let identity = IdentityStore::new(store);
    let params = Arc::new(DeviceConnect::new(
        identity.clone(),
        ConnectInfo::default(),
        None,
    ));
    (GatewayClient::new(ClientConfig::new(url), params), identity)
}

#[tokio::test]
async fn test_connect_handshake_request_and_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let nonce = uuid::Uuid::new_v4().to_string();
    let server_nonce = nonce.clone();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        send_event(
            &mut ws,
            "connect.challenge",
            json!({"nonce": server_nonce, "ts": 1}),
        )
        .await;
        let connect = read_request(&mut ws).await;
        assert_eq!(connect["method"], json!("connect"));
        verify_connect_signature(&connect["params"], &server_nonce);
        send_ok(
            &mut ws,
            connect["id"].as_str().unwrap(),
            json!({
                "protocol": 3,
                "auth": {
                    "deviceToken": "dev-tok-1",
                    "role": "operator",
                    "scopes": ["operator.read", "operator.write"],
                    "issuedAtMs": 1,
                },
            }),
        )
        .await;

        let list = read_request(&mut ws).await;
        assert_eq!(list["method"], json!("sessions.list"));
        send_ok(
            &mut ws,
            list["id"].as_str().unwrap(),
            json!({"ts": 1, "count": 1, "sessions": [{"key": "main", "updatedAt": 42}]}),
        )
        .await;
        send_event(
            &mut ws,
            "chat",
            json!({"runId": "r1", "sessionKey": "main", "seq": 0, "state": "delta", "message": "Hi"}),
        )
        .await;

        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    let dir = TempDir::new().unwrap();
    let (client, identity) = test_client(&dir, format!("ws://{addr}"));

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = client.on_event("chat", move |_event, payload| {
        let _ = event_tx.send(payload.clone());
    });

    let hello = client.connect().await.unwrap();
    assert_eq!(hello["auth"]["deviceToken"], json!("dev-tok-1"));
    assert!(matches!(
        client.status(),
        ConnectionStatus::Connected { .. }
    ));

    // The issued device token was persisted onto the identity
    let (loaded, _) = identity.load_or_create().unwrap();
    assert_eq!(loaded.device_token(), Some("dev-tok-1"));

    let payload = client.request("sessions.list", None).await.unwrap();
    assert_eq!(payload["sessions"][0]["key"], json!("main"));

    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event["state"], json!("delta"));
    assert_eq!(event["runId"], json!("r1"));

    client.disconnect().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    server.await.unwrap();
}

#[tokio::test]
async fn test_new_connect_rejects_requests_from_superseded_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (held_tx, held_rx) = tokio::sync::oneshot::channel();

    let server = tokio::spawn(async move {
        // First connection: handshake, then hold the next request unanswered
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        server_handshake(&mut ws, "nonce-1", json!({"protocol": 3})).await;
        let held = read_request(&mut ws).await;
        assert_eq!(held["method"], json!("sessions.list"));
        held_tx.send(()).unwrap();

        // Second connection: handshake and serve normally
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws2 = accept_async(stream).await.unwrap();
        server_handshake(&mut ws2, "nonce-2", json!({"protocol": 3})).await;
        let request = read_request(&mut ws2).await;
        send_ok(
            &mut ws2,
            request["id"].as_str().unwrap(),
            json!({"sessions": []}),
        )
        .await;
        while let Some(Ok(message)) = ws2.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
        drop(ws);
    });

    let dir = TempDir::new().unwrap();
    let (client, _) = test_client(&dir, format!("ws://{addr}"));
    client.connect().await.unwrap();

    let superseded = {
        let client = client.clone();
        tokio::spawn(async move { client.request("sessions.list", None).await })
    };
    tokio::time::timeout(Duration::from_secs(5), held_rx)
        .await
        .unwrap()
        .unwrap();

    // Dialing again invalidates the first connection; the held request must
    // settle with a rejection instead of hanging
    client.connect().await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), superseded)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, GatewayError::SocketClosed));

    let payload = client.request("sessions.list", None).await.unwrap();
    assert_eq!(payload["sessions"], json!([]));

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_pending_rejected_on_drop_then_reconnects() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection: handshake, then drop on the first request
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        server_handshake(&mut ws, "nonce-1", json!({"protocol": 3})).await;
        let _pending = read_request(&mut ws).await;
        drop(ws);

        // Second connection: handshake and serve normally
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        server_handshake(&mut ws, "nonce-2", json!({"protocol": 3})).await;
        let request = read_request(&mut ws).await;
        assert_eq!(request["method"], json!("sessions.list"));
        send_ok(
            &mut ws,
            request["id"].as_str().unwrap(),
            json!({"sessions": []}),
        )
        .await;
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("state.json")).unwrap());
    let identity = IdentityStore::new(store);
    let params = Arc::new(DeviceConnect::new(
        identity,
        ConnectInfo::default(),
        None,
    ));
    let mut config = ClientConfig::new(format!("ws://{addr}"));
    config.reconnect_initial_ms = 50;
    config.reconnect_max_ms = 200;
    let client = GatewayClient::new(config, params);

    client.connect().await.unwrap();

    // The in-flight request is rejected when the gateway drops the socket
    let err = client.request("sessions.list", None).await.unwrap_err();
    assert!(matches!(err, GatewayError::SocketClosed));

    // The client reconnects on its own
    let mut status = client.watch_status();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if matches!(*status.borrow(), ConnectionStatus::Connected { .. }) {
                break;
            }
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    let payload = client.request("sessions.list", None).await.unwrap();
    assert_eq!(payload["sessions"], json!([]));

    client.disconnect().await;
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    server.await.unwrap();
}
