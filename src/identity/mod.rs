//! Device identity and handshake signing.
//!
//! Each install owns a persistent Ed25519 keypair. The device id is the hex
//! SHA-256 of the raw public key, so the gateway can re-derive it from the
//! submitted key. On connect the client signs the canonical auth payload
//! (including the challenge nonce) and the gateway verifies the signature
//! against the paired public key.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::client::{ConnectParamsBuilder, GatewayError};
use crate::credentials::AuthToken;
use crate::store::{StateStore, StoreError};
use crate::util::now_ms;

/// Store key holding the persisted identity record.
pub const IDENTITY_STORE_KEY: &str = "device.identity";

/// Canonical auth payload version. The nonce-bearing form is the only one
/// this client emits.
const AUTH_PAYLOAD_VERSION: &str = "v2";

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity store error: {0}")]
    Store(#[from] StoreError),
    #[error("random generator failure: {0}")]
    Rng(String),
}

/// How the identity returned by [`IdentityStore::load_or_create`] came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrigin {
    Created,
    Loaded,
    /// The stored record was inconsistent or unusable and had to be repaired
    /// or regenerated. The gateway may require re-pairing.
    Recovered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    /// Ed25519 seed, unpadded url-safe base64.
    seed: String,
    public_key: String,
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_token: Option<String>,
}

/// A usable device identity with its signing key in memory.
pub struct DeviceIdentity {
    signing_key: SigningKey,
    public_key: String,
    device_id: String,
    device_token: Option<String>,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("has_token", &self.device_token.is_some())
            .finish()
    }
}

impl DeviceIdentity {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw public key, unpadded url-safe base64.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn device_token(&self) -> Option<&str> {
        self.device_token.as_deref()
    }

    /// Detached signature over `payload`, unpadded url-safe base64.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

/// Fields feeding the canonical device auth payload.
pub struct DeviceAuthParams<'a> {
    pub device_id: &'a str,
    pub client_id: &'a str,
    pub client_mode: &'a str,
    pub role: &'a str,
    pub scopes: &'a [String],
    pub signed_at_ms: u64,
    pub token: Option<&'a str>,
    pub nonce: &'a str,
}

/// Build the pipe-delimited payload the gateway verifies the device
/// signature against.
pub fn build_device_auth_payload(params: &DeviceAuthParams<'_>) -> String {
    [
        AUTH_PAYLOAD_VERSION,
        params.device_id,
        params.client_id,
        params.client_mode,
        params.role,
        &params.scopes.join(","),
        &params.signed_at_ms.to_string(),
        params.token.unwrap_or(""),
        params.nonce,
    ]
    .join("|")
}

fn decode_flexible(input: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input)
        .or_else(|_| STANDARD.decode(input))
        .ok()
}

fn encode_public_key(signing_key: &SigningKey) -> String {
    URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes())
}

fn derive_device_id(signing_key: &SigningKey) -> String {
    hex::encode(Sha256::digest(signing_key.verifying_key().to_bytes()))
}

// ============================================================================
// Identity persistence
// ============================================================================

/// Store-backed identity lifecycle: load, repair, regenerate, token updates.
#[derive(Clone)]
pub struct IdentityStore {
    store: Arc<StateStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Load the persisted identity, repairing or regenerating as needed.
    ///
    /// The seed is the source of truth: derived fields that disagree with it
    /// are rewritten (keeping any device token). An undecodable seed forces a
    /// fresh identity, which drops the token since the gateway bound it to
    /// the old key.
    pub fn load_or_create(&self) -> Result<(DeviceIdentity, IdentityOrigin), IdentityError> {
        let stored: Option<StoredIdentity> = self.store.get(IDENTITY_STORE_KEY)?;
        let Some(stored) = stored else {
            let identity = self.create_fresh()?;
            tracing::info!(device_id = %identity.device_id, "created device identity");
            return Ok((identity, IdentityOrigin::Created));
        };

        let seed = decode_flexible(&stored.seed).and_then(|bytes| <[u8; 32]>::try_from(bytes).ok());
        let Some(seed) = seed else {
            tracing::warn!("stored device identity seed unusable; regenerating");
            let identity = self.create_fresh()?;
            return Ok((identity, IdentityOrigin::Recovered));
        };

        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = encode_public_key(&signing_key);
        let device_id = derive_device_id(&signing_key);
        let identity = DeviceIdentity {
            signing_key,
            public_key,
            device_id,
            device_token: stored.device_token,
        };

        if stored.public_key == identity.public_key && stored.device_id == identity.device_id {
            return Ok((identity, IdentityOrigin::Loaded));
        }

        tracing::warn!(
            device_id = %identity.device_id,
            "repaired inconsistent device identity record"
        );
        self.persist(&identity)?;
        Ok((identity, IdentityOrigin::Recovered))
    }

    /// Attach the device token issued by a successful handshake.
    pub fn record_device_token(&self, token: &str) -> Result<(), IdentityError> {
        let Some(mut stored) = self.store.get::<StoredIdentity>(IDENTITY_STORE_KEY)? else {
            tracing::warn!("no device identity to attach token to");
            return Ok(());
        };
        stored.device_token = Some(token.to_string());
        self.store.put(IDENTITY_STORE_KEY, &stored)?;
        Ok(())
    }

    /// Drop the identity entirely. The next load creates a fresh keypair.
    pub fn clear(&self) -> Result<(), IdentityError> {
        self.store.delete(IDENTITY_STORE_KEY)?;
        Ok(())
    }

    fn create_fresh(&self) -> Result<DeviceIdentity, IdentityError> {
        let mut seed = [0u8; 32];
        crate::crypto::fill_random(&mut seed).map_err(|e| IdentityError::Rng(e.to_string()))?;
        let signing_key = SigningKey::from_bytes(&seed);
        let identity = DeviceIdentity {
            public_key: encode_public_key(&signing_key),
            device_id: derive_device_id(&signing_key),
            device_token: None,
            signing_key,
        };
        self.persist(&identity)?;
        Ok(identity)
    }

    fn persist(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
        let record = StoredIdentity {
            seed: URL_SAFE_NO_PAD.encode(identity.signing_key.to_bytes()),
            public_key: identity.public_key.clone(),
            device_id: identity.device_id.clone(),
            device_token: identity.device_token.clone(),
        };
        self.store.put(IDENTITY_STORE_KEY, &record)?;
        Ok(())
    }
}

// ============================================================================
// Connect params
// ============================================================================

/// Static client descriptor sent in the `connect` request.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub client_id: String,
    pub client_mode: String,
    pub client_version: String,
    pub platform: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            client_id: "carabiner".into(),
            client_mode: "mobile".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            role: "operator".into(),
            scopes: vec!["operator.read".into(), "operator.write".into()],
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
        }
    }
}

/// [`ConnectParamsBuilder`] backed by the persistent device identity.
///
/// Prefers the device token from an earlier handshake over the shared access
/// token, and persists a freshly issued device token after each handshake.
pub struct DeviceConnect {
    identity: IdentityStore,
    info: ConnectInfo,
    shared_token: Option<AuthToken>,
}

impl DeviceConnect {
    pub fn new(identity: IdentityStore, info: ConnectInfo, shared_token: Option<AuthToken>) -> Self {
        Self {
            identity,
            info,
            shared_token,
        }
    }
}

impl ConnectParamsBuilder for DeviceConnect {
    fn build(&self, challenge: &Value) -> Result<Value, GatewayError> {
        let nonce = challenge
            .get("nonce")
            .and_then(Value::as_str)
            .filter(|nonce| !nonce.is_empty())
            .ok_or_else(|| GatewayError::Handshake("challenge missing nonce".into()))?;

        let (identity, origin) = self.identity.load_or_create()?;
        if origin == IdentityOrigin::Recovered {
            tracing::warn!(
                device_id = %identity.device_id(),
                "device identity was recovered; gateway may require re-pairing"
            );
        }

        let info = &self.info;
        let signed_at = now_ms();
        let token = identity
            .device_token()
            .map(str::to_string)
            .or_else(|| self.shared_token.as_ref().map(|t| t.expose().to_string()));

        let payload = build_device_auth_payload(&DeviceAuthParams {
            device_id: identity.device_id(),
            client_id: &info.client_id,
            client_mode: &info.client_mode,
            role: &info.role,
            scopes: &info.scopes,
            signed_at_ms: signed_at,
            token: token.as_deref(),
            nonce,
        });
        let signature = identity.sign(&payload);

        let mut auth = serde_json::Map::new();
        if let Some(token) = &token {
            auth.insert("token".into(), json!(token));
        }

        Ok(json!({
            "minProtocol": info.min_protocol,
            "maxProtocol": info.max_protocol,
            "client": {
                "id": info.client_id,
                "version": info.client_version,
                "platform": info.platform,
                "mode": info.client_mode,
            },
            "role": info.role,
            "scopes": info.scopes,
            "auth": auth,
            "device": {
                "id": identity.device_id(),
                "publicKey": identity.public_key(),
                "signature": signature,
                "signedAt": signed_at,
                "nonce": nonce,
            },
        }))
    }

    fn handshake_complete(&self, hello: &Value) {
        let Some(token) = hello
            .pointer("/auth/deviceToken")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
        else {
            return;
        };
        match self.identity.record_device_token(token) {
            Ok(()) => tracing::debug!("device token persisted"),
            Err(err) => tracing::warn!(error = %err, "failed to persist device token"),
        }
    }
}
