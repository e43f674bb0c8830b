//! Session catalog.
//!
//! Merges the gateway's `sessions.list` rows with locally persisted pin and
//! label overrides. Pins and local labels never leave the device; remote
//! label/model edits go through `sessions.patch`.

use chrono::DateTime;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::client::GatewayError;
use crate::requester::Requester;
use crate::store::{StateStore, StoreError};

/// Store key holding the persisted overrides record.
pub const OVERRIDES_STORE_KEY: &str = "sessions.overrides";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("session store error: {0}")]
    Store(#[from] StoreError),
    #[error("malformed sessions.list payload: {0}")]
    MalformedPayload(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredOverrides {
    pinned: BTreeSet<String>,
    labels: BTreeMap<String, String>,
}

/// List query. `search` filters client-side so local label overrides are
/// matched too.
#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub limit: Option<u32>,
    pub search: Option<String>,
}

/// One reconciled catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionItem {
    pub key: String,
    /// Resolved display label: local override, then remote label, derived
    /// title, display name, and finally the key itself.
    pub label: String,
    pub pinned: bool,
    pub updated_at_ms: u64,
    pub model: Option<String>,
    pub last_message_preview: Option<String>,
}

pub struct SessionCatalog<R: Requester> {
    gateway: Arc<R>,
    store: Arc<StateStore>,
    overrides: RwLock<StoredOverrides>,
}

impl<R: Requester> SessionCatalog<R> {
    pub fn new(gateway: Arc<R>, store: Arc<StateStore>) -> Result<Self, SessionError> {
        let overrides = store
            .get::<StoredOverrides>(OVERRIDES_STORE_KEY)?
            .unwrap_or_default();
        Ok(Self {
            gateway,
            store,
            overrides: RwLock::new(overrides),
        })
    }

    /// Fetch remote rows and merge in local overrides.
    ///
    /// Result ordering: pinned sessions first, then most recently updated.
    /// Both groups keep their relative recency (the sort is stable).
    pub async fn list_sessions(
        &self,
        query: &SessionQuery,
    ) -> Result<Vec<SessionItem>, SessionError> {
        let mut params = json!({
            "includeLastMessage": true,
            "includeDerivedTitles": true,
        });
        if let Some(limit) = query.limit {
            params["limit"] = json!(limit);
        }
        let payload = self.gateway.request("sessions.list", params).await?;
        let rows = payload
            .get("sessions")
            .and_then(Value::as_array)
            .ok_or(SessionError::MalformedPayload("missing sessions array"))?;

        let overrides = self.overrides.read().clone();
        let mut items: Vec<SessionItem> = rows
            .iter()
            .filter_map(|row| {
                let key = row.get("key").and_then(Value::as_str)?.to_string();
                let label = overrides
                    .labels
                    .get(&key)
                    .cloned()
                    .or_else(|| field_string(row, "label"))
                    .or_else(|| field_string(row, "derivedTitle"))
                    .or_else(|| field_string(row, "displayName"))
                    .unwrap_or_else(|| key.clone());
                let pinned = overrides.pinned.contains(&key)
                    || row.get("pinned").and_then(Value::as_bool).unwrap_or(false);
                Some(SessionItem {
                    label,
                    pinned,
                    updated_at_ms: parse_updated_at(row.get("updatedAt")),
                    model: field_string(row, "model"),
                    last_message_preview: field_string(row, "lastMessagePreview"),
                    key,
                })
            })
            .collect();

        if let Some(search) = query.search.as_deref() {
            let needle = search.trim().to_lowercase();
            if !needle.is_empty() {
                items.retain(|item| {
                    item.key.to_lowercase().contains(&needle)
                        || item.label.to_lowercase().contains(&needle)
                });
            }
        }

        items.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.updated_at_ms.cmp(&a.updated_at_ms))
        });
        Ok(items)
    }

    // === Local overrides ===

    pub fn is_pinned(&self, key: &str) -> bool {
        self.overrides.read().pinned.contains(key)
    }

    /// Flip the local pin and return the new state.
    pub fn toggle_pinned(&self, key: &str) -> Result<bool, SessionError> {
        let pinned = !self.is_pinned(key);
        self.set_pinned(key, pinned)?;
        Ok(pinned)
    }

    /// Idempotent local pin update.
    pub fn set_pinned(&self, key: &str, pinned: bool) -> Result<(), SessionError> {
        let mut overrides = self.overrides.write();
        let changed = if pinned {
            overrides.pinned.insert(key.to_string())
        } else {
            overrides.pinned.remove(key)
        };
        if changed {
            self.persist(&overrides)?;
        }
        Ok(())
    }

    pub fn local_label(&self, key: &str) -> Option<String> {
        self.overrides.read().labels.get(key).cloned()
    }

    /// Set or clear (blank input) the device-local label for a session.
    pub fn set_local_label(&self, key: &str, label: &str) -> Result<(), SessionError> {
        let trimmed = label.trim();
        let mut overrides = self.overrides.write();
        let changed = if trimmed.is_empty() {
            overrides.labels.remove(key).is_some()
        } else {
            overrides.labels.insert(key.to_string(), trimmed.to_string())
                != Some(trimmed.to_string())
        };
        if changed {
            self.persist(&overrides)?;
        }
        Ok(())
    }

    // === Remote mutation ===

    /// Patch the remote label. Blank input clears it with an explicit null.
    pub async fn update_session_label(&self, key: &str, label: &str) -> Result<(), SessionError> {
        self.patch_field(key, "label", label).await
    }

    /// Patch the remote model override. Blank input clears it.
    pub async fn update_session_model(&self, key: &str, model: &str) -> Result<(), SessionError> {
        self.patch_field(key, "model", model).await
    }

    /// Reset the remote session entry (fresh transcript, defaults).
    pub async fn reset_session(&self, key: &str) -> Result<(), SessionError> {
        self.gateway
            .request("sessions.reset", json!({"key": key}))
            .await?;
        Ok(())
    }

    async fn patch_field(&self, key: &str, field: &str, value: &str) -> Result<(), SessionError> {
        let trimmed = value.trim();
        let value = if trimmed.is_empty() {
            Value::Null
        } else {
            Value::String(trimmed.to_string())
        };
        let params = json!({"key": key, field: value});
        self.gateway.request("sessions.patch", params).await?;
        Ok(())
    }

    fn persist(&self, overrides: &StoredOverrides) -> Result<(), SessionError> {
        self.store.put(OVERRIDES_STORE_KEY, overrides)?;
        Ok(())
    }
}

fn field_string(row: &Value, field: &str) -> Option<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// `updatedAt` arrives as epoch milliseconds or an ISO-8601 string; anything
/// unparsable sorts last as 0.
fn parse_updated_at(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.timestamp_millis().max(0) as u64)
            .unwrap_or(0),
        _ => 0,
    }
}
