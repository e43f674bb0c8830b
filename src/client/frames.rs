//! Gateway wire frames.
//!
//! All traffic is JSON text messages tagged by a `type` field: client
//! requests, gateway responses correlated by id, and server-push events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const ERROR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_NOT_PAIRED: &str = "NOT_PAIRED";
pub const ERROR_PAIRING_REQUIRED: &str = "PAIRING_REQUIRED";
pub const ERROR_UNAVAILABLE: &str = "UNAVAILABLE";
pub const ERROR_RATE_LIMITED: &str = "RATE_LIMITED";

/// Event carrying the handshake challenge nonce, pushed on socket open.
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    Req {
        id: String,
        method: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    Res {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorDetail>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

/// Structured error body on a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Response errors arrive either as a structured shape or a bare string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorDetail {
    Shape(ErrorShape),
    Text(String),
}

impl ErrorDetail {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Shape(shape) => shape.code.as_deref(),
            Self::Text(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Shape(shape) if !shape.message.is_empty() => shape.message.clone(),
            Self::Shape(shape) => shape.code.clone().unwrap_or_else(|| "request failed".into()),
            Self::Text(text) => text.clone(),
        }
    }

    pub fn retryable(&self) -> Option<bool> {
        match self {
            Self::Shape(shape) => shape.retryable,
            Self::Text(_) => None,
        }
    }
}
