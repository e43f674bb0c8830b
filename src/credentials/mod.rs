//! Gateway endpoint credentials.
//!
//! The endpoint URL plus an optional shared access token, persisted under
//! their own store key. Token material is zeroized on drop and masked in
//! debug output.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::store::{StateStore, StoreError};

/// Store key holding the persisted credentials record.
pub const CREDENTIALS_STORE_KEY: &str = "gateway.credentials";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

/// Shared access token. Zeroized on drop; debug output hides the value.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthToken([len {}])", self.0.len())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCredentials {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<AuthToken>,
}

impl GatewayCredentials {
    pub fn new(url: impl Into<String>, token: Option<AuthToken>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

/// Store-backed credential persistence.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<StateStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Option<GatewayCredentials>, CredentialError> {
        Ok(self.store.get(CREDENTIALS_STORE_KEY)?)
    }

    /// Validate and persist credentials. Only `ws://` and `wss://` endpoints
    /// are accepted.
    pub fn save(&self, credentials: &GatewayCredentials) -> Result<(), CredentialError> {
        let url = Url::parse(&credentials.url)
            .map_err(|e| CredentialError::InvalidUrl(e.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(CredentialError::InvalidUrl(format!(
                    "unsupported scheme: {other}"
                )))
            }
        }
        self.store.put(CREDENTIALS_STORE_KEY, credentials)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), CredentialError> {
        self.store.delete(CREDENTIALS_STORE_KEY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential_store() -> CredentialStore {
        CredentialStore::new(Arc::new(StateStore::in_memory()))
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = credential_store();
        assert!(store.load().unwrap().is_none());

        store
            .save(&GatewayCredentials::new(
                "wss://gw.example.com/ws",
                Some(AuthToken::new("tok-1")),
            ))
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.url, "wss://gw.example.com/ws");
        assert_eq!(loaded.token.unwrap().expose(), "tok-1");
    }

    #[test]
    fn test_rejects_non_websocket_urls() {
        let store = credential_store();
        let err = store
            .save(&GatewayCredentials::new("https://gw.example.com", None))
            .unwrap_err();
        assert!(matches!(err, CredentialError::InvalidUrl(_)));

        let err = store
            .save(&GatewayCredentials::new("not a url", None))
            .unwrap_err();
        assert!(matches!(err, CredentialError::InvalidUrl(_)));
    }

    #[test]
    fn test_clear_removes_credentials() {
        let store = credential_store();
        store
            .save(&GatewayCredentials::new("ws://127.0.0.1:9000", None))
            .unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_token_debug_is_masked() {
        let token = AuthToken::new("super-secret");
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[len 12]"));
    }
}
