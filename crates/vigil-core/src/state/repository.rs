//! Per-module key/value state.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::StateError;

use super::locks;
use super::record::{MAX_RECORD_BYTES, StateRecord, compress, decompress};
use super::store::BlobStore;

/// Largest serialized value accepted by default (1 GiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1 << 30;

/// Durable key/value state scoped to one (module id, run-scope id) pair.
///
/// Keys are case-insensitive. Operations on the same key are serialized by a
/// process-wide per-key lock; operations on different keys run in parallel.
/// Every call performs blocking IO. The repository assumes it is the only
/// process touching its keys.
#[derive(Clone)]
pub struct StateRepository {
    store: Arc<dyn BlobStore>,
    module_id: String,
    run_scope_id: String,
    max_payload_bytes: usize,
}

impl StateRepository {
    pub fn new(
        store: Arc<dyn BlobStore>,
        module_id: impl Into<String>,
        run_scope_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            module_id: module_id.into(),
            run_scope_id: run_scope_id.into(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Override the payload cap.
    pub fn with_max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    pub fn run_scope_id(&self) -> &str {
        &self.run_scope_id
    }

    /// Normalized form of a key, used for locking and storage.
    pub fn normalize_key(key: &str) -> String {
        key.trim().to_lowercase()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn store_state<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<(), StateError> {
        let key = Self::normalize_key(key);
        let blob = self.blob_name(&key);

        let lock = locks::lock_for(&blob);
        let _guard = locks::acquire(&lock, cancel).ok_or_else(|| StateError::Canceled {
            key: key.clone(),
        })?;

        let payload = serde_json::to_vec(value).map_err(|e| StateError::Serialization {
            key: key.clone(),
            message: e.to_string(),
        })?;
        if payload.len() > self.max_payload_bytes {
            return Err(StateError::TooBig {
                key,
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }

        let compressed_payload = compress(&payload).map_err(|source| StateError::Save {
            key: key.clone(),
            source,
        })?;
        let record = StateRecord {
            owner_module_id: self.module_id.clone(),
            owner_run_scope_id: self.run_scope_id.clone(),
            key: key.clone(),
            compressed_payload,
        };
        let bytes = record.encode().map_err(|message| StateError::Serialization {
            key: key.clone(),
            message,
        })?;
        if bytes.len() > MAX_RECORD_BYTES {
            return Err(StateError::TooBig {
                key,
                size: bytes.len(),
                limit: MAX_RECORD_BYTES,
            });
        }

        self.store
            .put(&blob, &bytes)
            .map_err(|source| StateError::Save { key: key.clone(), source })?;

        tracing::debug!(
            module = %self.module_id,
            scope = %self.run_scope_id,
            "Stored state '{}' ({} bytes, {} compressed)",
            key,
            payload.len(),
            bytes.len()
        );
        Ok(())
    }

    /// Read the value under `key`, or `T::default()` when there is none.
    ///
    /// A stored record that does not belong to this repository is deleted and
    /// reported as absent.
    pub fn get_state<T: DeserializeOwned + Default>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<T, StateError> {
        Ok(self.try_get_state(key, cancel)?.unwrap_or_default())
    }

    /// Like [`get_state`](Self::get_state), but tells an absent key apart
    /// from a stored default value.
    pub fn try_get_state<T: DeserializeOwned>(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, StateError> {
        let key = Self::normalize_key(key);
        let blob = self.blob_name(&key);

        let lock = locks::lock_for(&blob);
        let _guard = locks::acquire(&lock, cancel).ok_or_else(|| StateError::Canceled {
            key: key.clone(),
        })?;

        let bytes = match self.store.get(&blob) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(source) => return Err(StateError::Load { key, source }),
        };

        let record = match StateRecord::decode(&bytes) {
            Ok(record) if record.is_owned_by(&self.module_id, &self.run_scope_id, &key) => record,
            Ok(record) => {
                tracing::warn!(
                    "State '{}' of module '{}' is owned by '{}'/'{}'/'{}', purging it",
                    key,
                    self.module_id,
                    record.owner_module_id,
                    record.owner_run_scope_id,
                    record.key
                );
                self.purge(&blob, &key);
                return Ok(None);
            }
            Err(e) => {
                tracing::warn!(
                    "State '{}' of module '{}' is unreadable ({}), purging it",
                    key,
                    self.module_id,
                    e
                );
                self.purge(&blob, &key);
                return Ok(None);
            }
        };

        let payload =
            decompress(&record.compressed_payload).map_err(|e| StateError::Serialization {
                key: key.clone(),
                message: format!("failed to decompress payload: {}", e),
            })?;
        serde_json::from_slice(&payload)
            .map(Some)
            .map_err(|e| StateError::Serialization {
                key,
                message: e.to_string(),
            })
    }

    /// Remove the value under `key`. Removing a missing key succeeds.
    pub fn delete_state(&self, key: &str, cancel: &CancellationToken) -> Result<(), StateError> {
        let key = Self::normalize_key(key);
        let blob = self.blob_name(&key);

        let lock = locks::lock_for(&blob);
        let _guard = locks::acquire(&lock, cancel).ok_or_else(|| StateError::Canceled {
            key: key.clone(),
        })?;

        self.store
            .delete_if_exists(&blob)
            .map_err(|source| StateError::Delete { key, source })
    }

    /// Best-effort removal of a corrupt record. Caller holds the key lock.
    fn purge(&self, blob: &str, key: &str) {
        if let Err(e) = self.store.delete_if_exists(blob) {
            tracing::warn!("Failed to purge corrupt state '{}': {}", key, e);
        }
    }

    fn blob_name(&self, normalized_key: &str) -> String {
        format!(
            "m{}/s{}/k{}",
            URL_SAFE_NO_PAD.encode(&self.module_id),
            URL_SAFE_NO_PAD.encode(&self.run_scope_id),
            URL_SAFE_NO_PAD.encode(normalized_key)
        )
    }
}

impl std::fmt::Debug for StateRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRepository")
            .field("module_id", &self.module_id)
            .field("run_scope_id", &self.run_scope_id)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .finish_non_exhaustive()
    }
}
