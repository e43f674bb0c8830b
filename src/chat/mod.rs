//! Streaming chat over the gateway.
//!
//! `chat.send` acknowledges with a run id; the assistant reply then streams
//! in as `chat` events carrying `delta`/`final`/`aborted`/`error` states.
//! The service tracks one active run, accumulates delta text, and ignores
//! events for runs it no longer cares about.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::client::GatewayError;
use crate::requester::Requester;
use crate::util::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("chat send rejected: {summary}")]
    SendRejected { summary: String },
    #[error("malformed {method} payload: {detail}")]
    MalformedPayload {
        method: &'static str,
        detail: &'static str,
    },
}

/// Ack status on a `chat.send` response. Anything but an error counts as a
/// successful start; the raw status is preserved for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Started,
    InFlight,
    Ok,
    Other(String),
}

impl SendStatus {
    fn parse(raw: &str) -> Self {
        match raw {
            "started" => Self::Started,
            "in_flight" | "inFlight" => Self::InFlight,
            "ok" => Self::Ok,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendAck {
    pub run_id: String,
    pub status: SendStatus,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: Option<String>,
    pub role: String,
    pub text: String,
    pub ts: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ChatHistory {
    pub session_key: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct AbortOutcome {
    pub ok: bool,
    pub aborted: bool,
    pub run_ids: Vec<String>,
}

/// Progress of the active run, produced by [`ChatService::handle_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatUpdate {
    /// New delta arrived; `text` is the full accumulated reply so far.
    Delta { run_id: String, text: String },
    Completed { run_id: String, message: String },
    Aborted { run_id: String },
    Failed { run_id: String, message: String },
}

struct ActiveRun {
    run_id: String,
    session_key: String,
    buffer: String,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveRun>,
}

pub struct ChatService<R: Requester> {
    gateway: Arc<R>,
    runs: Mutex<RunState>,
}

impl<R: Requester> ChatService<R> {
    pub fn new(gateway: Arc<R>) -> Self {
        Self {
            gateway,
            runs: Mutex::new(RunState::default()),
        }
    }

    /// Send a user message. An explicit `idempotency_key` is forwarded
    /// verbatim; otherwise one is synthesized. Either way the key doubles as
    /// the expected run id until the ack names one, so deltas racing ahead
    /// of the ack are not lost.
    pub async fn send(
        &self,
        session_key: &str,
        text: &str,
        idempotency_key: Option<&str>,
    ) -> Result<SendAck, ChatError> {
        let idempotency_key = match idempotency_key {
            Some(key) => key.to_string(),
            None => {
                let suffix = crate::crypto::generate_hex_secret(4)
                    .map_err(|e| GatewayError::Rng(e.to_string()))?;
                format!("{}:{}:{}", session_key, now_ms(), suffix)
            }
        };

        self.runs.lock().active = Some(ActiveRun {
            run_id: idempotency_key.clone(),
            session_key: session_key.to_string(),
            buffer: String::new(),
        });

        let params = json!({
            "sessionKey": session_key,
            "message": text,
            "idempotencyKey": idempotency_key,
        });
        let payload = match self.gateway.request("chat.send", params).await {
            Ok(payload) => payload,
            Err(err) => {
                self.clear_run(&idempotency_key);
                return Err(err.into());
            }
        };

        let status_raw = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("accepted");
        if status_raw == "error" {
            self.clear_run(&idempotency_key);
            let summary = payload
                .get("summary")
                .and_then(Value::as_str)
                .or_else(|| payload.get("errorMessage").and_then(Value::as_str))
                .unwrap_or("chat send failed")
                .to_string();
            return Err(ChatError::SendRejected { summary });
        }

        let run_id = payload
            .get("runId")
            .and_then(Value::as_str)
            .unwrap_or(&idempotency_key)
            .to_string();
        if run_id != idempotency_key {
            let mut runs = self.runs.lock();
            if let Some(active) = runs.active.as_mut() {
                if active.run_id == idempotency_key {
                    active.run_id = run_id.clone();
                }
            }
        }
        tracing::debug!(run_id = %run_id, status = status_raw, "chat send acknowledged");
        Ok(SendAck {
            run_id,
            status: SendStatus::parse(status_raw),
        })
    }

    /// Fetch message history for a session.
    pub async fn history(
        &self,
        session_key: &str,
        limit: Option<u32>,
    ) -> Result<ChatHistory, ChatError> {
        let mut params = json!({"sessionKey": session_key});
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        let payload = self.gateway.request("chat.history", params).await?;

        let session_key = payload
            .get("sessionKey")
            .and_then(Value::as_str)
            .ok_or(ChatError::MalformedPayload {
                method: "chat.history",
                detail: "missing sessionKey",
            })?
            .to_string();
        let rows = payload
            .get("messages")
            .and_then(Value::as_array)
            .ok_or(ChatError::MalformedPayload {
                method: "chat.history",
                detail: "missing messages array",
            })?;

        let messages = rows
            .iter()
            .map(|row| ChatMessage {
                id: row.get("id").and_then(Value::as_str).map(str::to_string),
                role: row
                    .get("role")
                    .and_then(Value::as_str)
                    .unwrap_or("assistant")
                    .to_string(),
                text: extract_text(Some(row)).unwrap_or_default(),
                ts: row.get("ts").and_then(Value::as_u64),
            })
            .collect();
        Ok(ChatHistory {
            session_key,
            messages,
        })
    }

    /// Abort the active run (or every run on the session when `run_id` is
    /// not given). Returns which runs the gateway actually stopped.
    pub async fn abort(
        &self,
        session_key: &str,
        run_id: Option<&str>,
    ) -> Result<AbortOutcome, ChatError> {
        let mut params = json!({"sessionKey": session_key});
        if let Some(run_id) = run_id {
            params["runId"] = json!(run_id);
        }
        let payload = self.gateway.request("chat.abort", params).await?;

        {
            let mut runs = self.runs.lock();
            let clear = match (&runs.active, run_id) {
                (Some(active), Some(run_id)) => active.run_id == run_id,
                (Some(active), None) => active.session_key == session_key,
                (None, _) => false,
            };
            if clear {
                runs.active = None;
            }
        }

        let run_ids = payload
            .get("runIds")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(AbortOutcome {
            ok: payload.get("ok").and_then(Value::as_bool).unwrap_or(true),
            aborted: payload
                .get("aborted")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            run_ids,
        })
    }

    /// Feed a `chat` event payload through the run state machine.
    ///
    /// Events for runs other than the active one are ignored. Terminal
    /// states clear the active run.
    pub fn handle_event(&self, payload: &Value) -> Option<ChatUpdate> {
        let run_id = payload.get("runId").and_then(Value::as_str)?;
        let state = payload.get("state").and_then(Value::as_str)?;

        let mut runs = self.runs.lock();
        match runs.active.as_ref() {
            Some(active) if active.run_id == run_id => {}
            _ => {
                tracing::debug!(run_id, state, "ignoring chat event for inactive run");
                return None;
            }
        }
        let run = run_id.to_string();

        match state {
            "delta" => {
                let active = runs.active.as_mut()?;
                if let Some(text) = extract_text(payload.get("message")) {
                    active.buffer.push_str(&text);
                }
                Some(ChatUpdate::Delta {
                    run_id: run,
                    text: active.buffer.clone(),
                })
            }
            "final" => {
                let active = runs.active.take()?;
                let message =
                    extract_text(payload.get("message")).unwrap_or(active.buffer);
                Some(ChatUpdate::Completed {
                    run_id: run,
                    message,
                })
            }
            "aborted" => {
                runs.active = None;
                Some(ChatUpdate::Aborted { run_id: run })
            }
            "error" => {
                runs.active = None;
                let message = payload
                    .get("errorMessage")
                    .and_then(Value::as_str)
                    .unwrap_or("agent run failed")
                    .to_string();
                Some(ChatUpdate::Failed {
                    run_id: run,
                    message,
                })
            }
            other => {
                tracing::debug!(state = other, "unknown chat event state");
                None
            }
        }
    }

    fn clear_run(&self, run_id: &str) {
        let mut runs = self.runs.lock();
        if runs
            .active
            .as_ref()
            .map(|active| active.run_id == run_id)
            .unwrap_or(false)
        {
            runs.active = None;
        }
    }
}

/// Pull display text out of the shapes gateways put message content in:
/// a bare string, `{text}`, `{content: "..."}` or `{content: [{type:
/// "text", text}, ...]}`.
fn extract_text(value: Option<&Value>) -> Option<String> {
    let value = value?;
    if let Some(text) = value.as_str() {
        return Some(text.to_string());
    }
    let object = value.as_object()?;
    if let Some(text) = object.get("text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    let content = object.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    let blocks = content.as_array()?;
    let mut out = String::new();
    for block in blocks {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                out.push_str(text);
            }
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
