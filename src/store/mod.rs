// Local Session Store
// Typed wrapper over durable client storage; four independently clearable keys

pub mod backend;

pub use backend::{FileStorage, MemoryStorage, StorageBackend};

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::model::{DeviceSession, SessionRecord};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage key names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub session_record: String,
    pub device_session: String,
    pub remembered_identity: String,
    pub last_visit: String,
}

impl From<&StorageConfig> for StorageKeys {
    fn from(config: &StorageConfig) -> Self {
        Self {
            session_record: config.session_record_key.clone(),
            device_session: config.device_session_key.clone(),
            remembered_identity: config.remembered_identity_key.clone(),
            last_visit: config.last_visit_key.clone(),
        }
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::from(&StorageConfig::default())
    }
}

/// Persisted session state
///
/// Readable by every component; only the Reconciler writes, hence the
/// crate-private mutators. Values are always replaced whole.
#[derive(Clone)]
pub struct LocalSessionStore {
    backend: Arc<dyn StorageBackend>,
    keys: StorageKeys,
}

impl LocalSessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>, keys: StorageKeys) -> Self {
        Self { backend, keys }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// Session record, if one is stored
    pub fn load_record(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.read_json(&self.keys.session_record)
    }

    /// Cheap synchronous check used by the Access-Control Gate fast path
    pub fn has_logged_in_flag(&self) -> bool {
        match self.load_record() {
            Ok(Some(record)) => record.logged_in,
            Ok(None) => false,
            Err(e) => {
                debug!(error = %e, "Unreadable session record treated as absent");
                false
            }
        }
    }

    pub fn load_device_session(&self) -> Result<Option<DeviceSession>, StoreError> {
        self.read_json(&self.keys.device_session)
    }

    /// Remembered identity handle (login email)
    pub fn remembered_identity(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .backend
            .get(&self.keys.remembered_identity)?
            .filter(|v| !v.trim().is_empty()))
    }

    /// Last-visit marker; an unparsable marker reads as absent
    pub fn last_visit(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.backend.get(&self.keys.last_visit)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed last-visit marker");
                Ok(None)
            }
        }
    }

    pub(crate) fn save_record(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.write_json(&self.keys.session_record, record)
    }

    pub(crate) fn clear_record(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.session_record)
    }

    pub(crate) fn save_device_session(&self, device: &DeviceSession) -> Result<(), StoreError> {
        self.write_json(&self.keys.device_session, device)
    }

    pub(crate) fn clear_device_session(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.device_session)
    }

    pub(crate) fn remember_identity(&self, identity: &str) -> Result<(), StoreError> {
        self.backend.set(&self.keys.remembered_identity, identity)
    }

    pub(crate) fn forget_identity(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.remembered_identity)
    }

    pub(crate) fn touch_last_visit(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.backend.set(&self.keys.last_visit, &now.to_rfc3339())
    }

    pub(crate) fn clear_last_visit(&self) -> Result<(), StoreError> {
        self.backend.remove(&self.keys.last_visit)
    }

    /// Clear all four keys; every key is attempted even if an earlier one fails
    pub(crate) fn clear_all(&self) -> Result<(), StoreError> {
        let results = [
            self.clear_record(),
            self.clear_device_session(),
            self.forget_identity(),
            self.clear_last_visit(),
        ];
        results.into_iter().collect()
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.backend.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, &raw)
    }
}

impl std::fmt::Debug for LocalSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSessionStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
