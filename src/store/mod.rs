//! Persistent client state store.
//!
//! A small namespaced JSON key-value store backing device identity, gateway
//! credentials, and session overrides. Writes are atomic (temp file + fsync +
//! rename) and a corrupted store file is backed up and replaced rather than
//! taking the client down.

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::PathBuf;

use crate::util::now_ms;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("JSON error: {0}")]
    Json(String),
}

/// Thread-safe key-value store with atomic file persistence.
pub struct StateStore {
    records: RwLock<BTreeMap<String, Value>>,
    storage_path: PathBuf,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("storage_path", &self.storage_path)
            .finish()
    }
}

impl StateStore {
    /// Open the store at the given path, creating it lazily on first write.
    pub fn open(storage_path: PathBuf) -> Result<Self, StoreError> {
        let records = Self::load_or_create(&storage_path)?;
        Ok(Self {
            records: RwLock::new(records),
            storage_path,
        })
    }

    /// Create an in-memory only store (for testing).
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            storage_path: PathBuf::new(),
        }
    }

    fn load_or_create(path: &PathBuf) -> Result<BTreeMap<String, Value>, StoreError> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        match serde_json::from_str(&content) {
            Ok(records) => Ok(records),
            Err(err) => {
                // If corrupted, back up and start over
                let backup = path.with_extension(format!("corrupt.{}.json", now_ms()));
                match fs::rename(path, &backup) {
                    Ok(()) => tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %err,
                        "backed up corrupted state store"
                    ),
                    Err(rename_err) => tracing::warn!(
                        path = %path.display(),
                        error = %rename_err,
                        "failed to back up corrupted state store"
                    ),
                }
                Ok(BTreeMap::new())
            }
        }
    }

    /// Read and deserialize the record under `key`.
    ///
    /// A record that no longer deserializes into `T` is treated as absent so
    /// a single bad record cannot wedge the client.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let records = self.records.read();
        let Some(value) = records.get(key) else {
            return Ok(None);
        };
        match serde_json::from_value(value.clone()) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding undeserializable store record");
                Ok(None)
            }
        }
    }

    /// Serialize and persist `value` under `key`.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::Json(e.to_string()))?;
        self.records.write().insert(key.to_string(), value);
        self.save()
    }

    /// Remove the record under `key`. Returns whether a record existed.
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.records.write().remove(key).is_some();
        if existed {
            self.save()?;
        }
        Ok(existed)
    }

    fn save(&self) -> Result<(), StoreError> {
        if self.storage_path.as_os_str().is_empty() {
            return Ok(());
        }

        let records = self.records.read();
        let content =
            serde_json::to_string_pretty(&*records).map_err(|e| StoreError::Json(e.to_string()))?;
        drop(records);

        if let Some(parent) = self.storage_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        // Write atomically
        let temp_path = self.storage_path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(|e| StoreError::Io(e.to_string()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            file.set_permissions(perms)
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        IoWrite::write_all(&mut file, content.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        file.sync_all().map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&temp_path, &self.storage_path).map_err(|e| StoreError::Io(e.to_string()))?;

        Ok(())
    }
}
