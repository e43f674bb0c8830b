//! Gateway connection client.
//!
//! One duplex WebSocket carries everything: client requests, gateway
//! responses correlated by id, and server-push events. The client owns the
//! pending-request table, fans events out to listeners, runs the
//! challenge/connect handshake on every (re)connection, and reconnects with
//! exponential backoff when the socket drops.

pub mod backoff;
pub mod events;
pub mod frames;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::logging;
use crate::requester::Requester;
use crate::util::now_ms;

pub use events::{EventSubscription, WILDCARD_EVENT};
pub use frames::{
    ErrorDetail, ErrorShape, GatewayFrame, ERROR_INVALID_REQUEST, ERROR_NOT_PAIRED,
    ERROR_PAIRING_REQUIRED, ERROR_RATE_LIMITED, ERROR_UNAVAILABLE, EVENT_CONNECT_CHALLENGE,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingSender = oneshot::Sender<Result<Value, GatewayError>>;

/// Default handshake timeout (challenge wait and connect response each).
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// Default delay before the first reconnect attempt.
pub const DEFAULT_RECONNECT_INITIAL_MS: u64 = 1_000;
/// Default backoff multiplier between reconnect attempts.
pub const DEFAULT_RECONNECT_FACTOR: f64 = 2.0;
/// Default reconnect delay cap.
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 15_000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not connected to gateway")]
    NotConnected,
    #[error("socket closed")]
    SocketClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("pairing required: {0}")]
    PairingRequired(String),
    #[error("gateway error: {message}")]
    Rpc {
        code: Option<String>,
        message: String,
        retryable: Option<bool>,
    },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("random generator failure: {0}")]
    Rng(String),
    #[error(transparent)]
    Identity(#[from] crate::identity::IdentityError),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

impl GatewayError {
    /// Map a response error body onto the client error taxonomy.
    pub(crate) fn from_error_detail(detail: Option<ErrorDetail>) -> Self {
        let Some(detail) = detail else {
            return Self::Rpc {
                code: None,
                message: "request failed".into(),
                retryable: None,
            };
        };
        let message = detail.message();
        match detail.code() {
            Some(ERROR_NOT_PAIRED) | Some(ERROR_PAIRING_REQUIRED) => Self::PairingRequired(message),
            code => Self::Rpc {
                code: code.map(str::to_string),
                message,
                retryable: detail.retryable(),
            },
        }
    }

    /// Whether this error means the device must be (re)paired with the
    /// gateway before the call can succeed.
    pub fn is_pairing_required(&self) -> bool {
        matches!(self, Self::PairingRequired(_))
    }
}

// ============================================================================
// Configuration and status
// ============================================================================

/// Supplies `connect` params once the challenge arrives, and observes the
/// hello payload after a successful handshake.
pub trait ConnectParamsBuilder: Send + Sync {
    fn build(&self, challenge: &Value) -> Result<Value, GatewayError>;

    /// Called after each successful handshake with the hello payload.
    fn handshake_complete(&self, _hello: &Value) {}
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway endpoint (`ws://` or `wss://`).
    pub url: String,
    /// Timeout applied to the challenge wait and to the connect response.
    pub handshake_timeout: Duration,
    pub reconnect_initial_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_max_ms: u64,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            reconnect_initial_ms: DEFAULT_RECONNECT_INITIAL_MS,
            reconnect_factor: DEFAULT_RECONNECT_FACTOR,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { since_ms: u64 },
    Reconnecting { attempt: u32, retry_at_ms: u64 },
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    config: ClientConfig,
    params: Arc<dyn ConnectParamsBuilder>,
    pending: Mutex<HashMap<String, PendingSender>>,
    listeners: Arc<events::ListenerRegistry>,
    status_tx: watch::Sender<ConnectionStatus>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    challenge_tx: Mutex<Option<oneshot::Sender<Value>>>,
    /// Whether a dropped socket should trigger automatic reconnects. Set
    /// after the first successful handshake, cleared by `disconnect()`.
    should_reconnect: AtomicBool,
    /// Consecutive failed reconnect attempts; reset on successful handshake.
    attempts: AtomicU32,
    /// Connection generation counter. Read loops and teardown paths from a
    /// superseded connection must not touch current state.
    epoch: AtomicU64,
}

/// Handle to the multiplexed gateway connection. Cheap to clone.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<ClientInner>,
}

impl GatewayClient {
    pub fn new(config: ClientConfig, params: Arc<dyn ConnectParamsBuilder>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                params,
                pending: Mutex::new(HashMap::new()),
                listeners: Arc::new(events::ListenerRegistry::default()),
                status_tx,
                writer: Mutex::new(None),
                challenge_tx: Mutex::new(None),
                should_reconnect: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Dial the gateway and run the handshake. Resolves with the hello
    /// payload. After the first success the client reconnects on its own
    /// whenever the socket drops, until [`disconnect`](Self::disconnect).
    pub async fn connect(&self) -> Result<Value, GatewayError> {
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Connecting);
        match establish(&self.inner).await {
            Ok(hello) => Ok(hello),
            Err(err) => {
                if !matches!(
                    *self.inner.status_tx.borrow(),
                    ConnectionStatus::Connected { .. }
                ) {
                    self.inner
                        .status_tx
                        .send_replace(ConnectionStatus::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Close the connection and stop reconnecting. In-flight requests are
    /// rejected with [`GatewayError::SocketClosed`].
    pub async fn disconnect(&self) {
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        claim_teardown(&self.inner, epoch);
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
        tracing::info!("gateway connection closed by client");
    }

    /// Issue a request and await its response payload. Fails fast with
    /// [`GatewayError::NotConnected`] when no handshaken connection exists.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, GatewayError> {
        if !matches!(
            *self.inner.status_tx.borrow(),
            ConnectionStatus::Connected { .. }
        ) {
            return Err(GatewayError::NotConnected);
        }
        send_request_internal(&self.inner, method, params).await
    }

    /// Register a listener for `event` (or [`WILDCARD_EVENT`] for all
    /// events). Dropping the returned subscription unsubscribes.
    pub fn on_event(
        &self,
        event: &str,
        callback: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> EventSubscription {
        self.inner.listeners.subscribe(event, Arc::new(callback))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Watch channel following connection status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl Requester for GatewayClient {
    fn request(
        &self,
        method: &str,
        params: Value,
    ) -> impl std::future::Future<Output = Result<Value, GatewayError>> + Send {
        GatewayClient::request(self, method, Some(params))
    }
}

// ============================================================================
// Connection lifecycle
// ============================================================================

async fn establish(inner: &Arc<ClientInner>) -> Result<Value, GatewayError> {
    let url = Url::parse(&inner.config.url).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(GatewayError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    }

    // A fresh dial supersedes whatever connection is live. Claiming the old
    // epoch here silences its read loop and rejects its in-flight requests;
    // otherwise they would never settle.
    claim_teardown(inner, inner.epoch.load(Ordering::SeqCst));

    let (ws, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| GatewayError::Transport(e.to_string()))?;
    let (sink, stream) = ws.split();

    let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    *inner.writer.lock() = Some(writer_tx);
    let (challenge_tx, challenge_rx) = oneshot::channel();
    *inner.challenge_tx.lock() = Some(challenge_tx);

    tokio::spawn(run_writer(sink, writer_rx));
    tokio::spawn(read_loop(Arc::clone(inner), stream, epoch));

    let hello = match handshake(inner, challenge_rx).await {
        Ok(hello) => hello,
        Err(err) => {
            claim_teardown(inner, epoch);
            return Err(err);
        }
    };

    inner.attempts.store(0, Ordering::SeqCst);
    inner.should_reconnect.store(true, Ordering::SeqCst);
    inner
        .status_tx
        .send_replace(ConnectionStatus::Connected { since_ms: now_ms() });
    inner.params.handshake_complete(&hello);
    tracing::info!("gateway connection established");
    Ok(hello)
}

async fn handshake(
    inner: &Arc<ClientInner>,
    challenge_rx: oneshot::Receiver<Value>,
) -> Result<Value, GatewayError> {
    let timeout = inner.config.handshake_timeout;
    let challenge = tokio::time::timeout(timeout, challenge_rx)
        .await
        .map_err(|_| GatewayError::Timeout("connect.challenge"))?
        .map_err(|_| GatewayError::SocketClosed)?;

    let params = inner.params.build(&challenge)?;
    tracing::debug!(params = %logging::redact_value(&params), "sending connect request");
    tokio::time::timeout(
        timeout,
        send_request_internal(inner, "connect", Some(params)),
    )
    .await
    .map_err(|_| GatewayError::Timeout("connect response"))?
}

async fn run_writer(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        if let Err(err) = sink.send(message).await {
            tracing::debug!(error = %err, "gateway write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<ClientInner>, mut stream: SplitStream<WsStream>, epoch: u64) {
    while let Some(next) = stream.next().await {
        if inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "gateway socket error");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<GatewayFrame>(text.as_str()) {
            Ok(frame) => dispatch_frame(&inner, frame),
            Err(err) => tracing::warn!(error = %err, "dropping unparseable gateway frame"),
        }
    }

    if !claim_teardown(&inner, epoch) {
        return;
    }
    if inner.should_reconnect.load(Ordering::SeqCst) {
        schedule_reconnect(inner);
    } else {
        inner
            .status_tx
            .send_replace(ConnectionStatus::Disconnected);
    }
}

/// Invalidate connection `epoch` and reject everything in flight. Returns
/// false when another path already tore this connection down or a newer
/// connection superseded it.
fn claim_teardown(inner: &Arc<ClientInner>, epoch: u64) -> bool {
    if inner
        .epoch
        .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    *inner.writer.lock() = None;
    *inner.challenge_tx.lock() = None;
    fail_all_pending(inner);
    true
}

fn fail_all_pending(inner: &ClientInner) {
    let pending: Vec<(String, PendingSender)> = {
        let mut map = inner.pending.lock();
        map.drain().collect()
    };
    if !pending.is_empty() {
        tracing::debug!(count = pending.len(), "rejecting in-flight requests");
    }
    for (_, tx) in pending {
        let _ = tx.send(Err(GatewayError::SocketClosed));
    }
}

fn schedule_reconnect(inner: Arc<ClientInner>) {
    let attempt = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = backoff::delay_for_attempt(
        attempt,
        inner.config.reconnect_initial_ms,
        inner.config.reconnect_factor,
        inner.config.reconnect_max_ms,
    );
    inner.status_tx.send_replace(ConnectionStatus::Reconnecting {
        attempt,
        retry_at_ms: now_ms() + delay,
    });
    tracing::info!(attempt, delay_ms = delay, "scheduling gateway reconnect");
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if !inner.should_reconnect.load(Ordering::SeqCst) {
            return;
        }
        match establish(&inner).await {
            Ok(_) => tracing::info!(attempt, "gateway reconnected"),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "gateway reconnect failed");
                if inner.should_reconnect.load(Ordering::SeqCst) {
                    schedule_reconnect(inner);
                }
            }
        }
    });
}

// ============================================================================
// Frame handling
// ============================================================================

async fn send_request_internal(
    inner: &Arc<ClientInner>,
    method: &str,
    params: Option<Value>,
) -> Result<Value, GatewayError> {
    let (id, rx) = register_pending(inner)?;

    let frame = GatewayFrame::Req {
        id: id.clone(),
        method: method.to_string(),
        params,
    };
    let text = serde_json::to_string(&frame).map_err(|e| GatewayError::Protocol(e.to_string()))?;

    let sent = {
        let writer = inner.writer.lock();
        match writer.as_ref() {
            Some(tx) => tx.send(Message::Text(text.into())).is_ok(),
            None => false,
        }
    };
    if !sent {
        inner.pending.lock().remove(&id);
        return Err(GatewayError::NotConnected);
    }

    rx.await.map_err(|_| GatewayError::SocketClosed)?
}

/// Allocate a request id (`{unix_ms}-{hex}`) and park a oneshot for it.
/// Ids are unique for the life of the pending table.
fn register_pending(
    inner: &ClientInner,
) -> Result<(String, oneshot::Receiver<Result<Value, GatewayError>>), GatewayError> {
    let mut pending = inner.pending.lock();
    loop {
        let suffix =
            crate::crypto::generate_hex_secret(4).map_err(|e| GatewayError::Rng(e.to_string()))?;
        let id = format!("{}-{}", now_ms(), suffix);
        if let Entry::Vacant(slot) = pending.entry(id.clone()) {
            let (tx, rx) = oneshot::channel();
            slot.insert(tx);
            return Ok((id, rx));
        }
    }
}

fn dispatch_frame(inner: &Arc<ClientInner>, frame: GatewayFrame) {
    match frame {
        GatewayFrame::Req { method, .. } => {
            tracing::warn!(method = %method, "ignoring request frame from gateway");
        }
        GatewayFrame::Res {
            id,
            ok,
            payload,
            error,
        } => {
            let waiter = inner.pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let result = if ok {
                        Ok(payload.unwrap_or(Value::Null))
                    } else {
                        Err(GatewayError::from_error_detail(error))
                    };
                    let _ = tx.send(result);
                }
                None => tracing::debug!(request_id = %id, "response for unknown request"),
            }
        }
        GatewayFrame::Event {
            event,
            payload,
            seq: _,
        } => {
            let payload = payload.unwrap_or(Value::Null);
            if event == EVENT_CONNECT_CHALLENGE {
                if let Some(tx) = inner.challenge_tx.lock().take() {
                    let _ = tx.send(payload.clone());
                }
            }
            inner.listeners.dispatch(&event, &payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopParams;

    impl ConnectParamsBuilder for NoopParams {
        fn build(&self, _challenge: &Value) -> Result<Value, GatewayError> {
            Ok(json!({}))
        }
    }

    fn test_client() -> GatewayClient {
        GatewayClient::new(ClientConfig::new("ws://127.0.0.1:1"), Arc::new(NoopParams))
    }

    fn ok_response(id: &str) -> GatewayFrame {
        GatewayFrame::Res {
            id: id.into(),
            ok: true,
            payload: Some(json!({"n": 1})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_request_rejected_when_disconnected() {
        let client = test_client();
        let err = client.request("sessions.list", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotConnected));
    }

    #[tokio::test]
    async fn test_response_settles_pending_exactly_once() {
        let client = test_client();
        let (tx, rx) = oneshot::channel();
        client.inner.pending.lock().insert("req-1".into(), tx);

        dispatch_frame(&client.inner, ok_response("req-1"));
        assert_eq!(rx.await.unwrap().unwrap()["n"], json!(1));

        // Duplicate response for the same id is dropped
        dispatch_frame(&client.inner, ok_response("req-1"));
        assert!(client.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_rejects_every_pending_request() {
        let client = test_client();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        client.inner.pending.lock().insert("a".into(), tx_a);
        client.inner.pending.lock().insert("b".into(), tx_b);

        let epoch = client.inner.epoch.load(Ordering::SeqCst);
        assert!(claim_teardown(&client.inner, epoch));

        assert!(matches!(
            rx_a.await.unwrap(),
            Err(GatewayError::SocketClosed)
        ));
        assert!(matches!(
            rx_b.await.unwrap(),
            Err(GatewayError::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn test_stale_epoch_cannot_tear_down() {
        let client = test_client();
        let epoch = client.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(claim_teardown(&client.inner, epoch));
        assert!(!claim_teardown(&client.inner, epoch));
    }

    #[tokio::test]
    async fn test_events_reach_named_then_wildcard_listeners() {
        let client = test_client();
        let log = Arc::new(Mutex::new(Vec::new()));

        let log_named = Arc::clone(&log);
        let _named = client.on_event("chat", move |event, payload| {
            log_named
                .lock()
                .push(format!("named:{event}:{}", payload["runId"]));
        });
        let log_wild = Arc::clone(&log);
        let _wild = client.on_event(WILDCARD_EVENT, move |event, _| {
            log_wild.lock().push(format!("wild:{event}"));
        });

        dispatch_frame(
            &client.inner,
            GatewayFrame::Event {
                event: "chat".into(),
                payload: Some(json!({"runId": "r1"})),
                seq: Some(1),
            },
        );
        assert_eq!(*log.lock(), vec!["named:chat:\"r1\"", "wild:chat"]);
    }

    #[tokio::test]
    async fn test_challenge_event_fulfills_handshake_waiter() {
        let client = test_client();
        let (tx, rx) = oneshot::channel();
        *client.inner.challenge_tx.lock() = Some(tx);

        dispatch_frame(
            &client.inner,
            GatewayFrame::Event {
                event: EVENT_CONNECT_CHALLENGE.into(),
                payload: Some(json!({"nonce": "n-1", "ts": 5})),
                seq: None,
            },
        );
        assert_eq!(rx.await.unwrap()["nonce"], json!("n-1"));
        assert!(client.inner.challenge_tx.lock().is_none());
    }

    #[tokio::test]
    async fn test_request_ids_are_unique_and_time_prefixed() {
        let client = test_client();
        let mut ids = std::collections::HashSet::new();
        for _ in 0..200 {
            let (id, _rx) = register_pending(&client.inner).unwrap();
            let (prefix, suffix) = id.split_once('-').expect("id has a suffix");
            assert!(prefix.parse::<u64>().is_ok());
            assert_eq!(suffix.len(), 8);
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn test_error_detail_mapping() {
        let err = GatewayError::from_error_detail(Some(ErrorDetail::Shape(ErrorShape {
            code: Some(ERROR_NOT_PAIRED.into()),
            message: "pairing required".into(),
            retryable: Some(false),
            details: None,
        })));
        assert!(err.is_pairing_required());

        let err = GatewayError::from_error_detail(Some(ErrorDetail::Text("nope".into())));
        match err {
            GatewayError::Rpc { code, message, .. } => {
                assert_eq!(code, None);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = GatewayError::from_error_detail(None);
        assert!(matches!(err, GatewayError::Rpc { .. }));
    }
}
