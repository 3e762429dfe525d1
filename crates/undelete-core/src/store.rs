use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors produced by key-value store implementations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Credential material is missing, unreadable or not PEM.
    #[error("invalid credential material at {path}: {reason}")]
    Config { path: String, reason: String },
    /// Secure channel could not be established.
    #[error("connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },
    /// Prefix read failed.
    #[error("scan of prefix {prefix} failed: {reason}")]
    Scan { prefix: String, reason: String },
    /// Single-key write failed or was not acknowledged.
    #[error("write of key {key} failed: {reason}")]
    Write { key: String, reason: String },
}

/// One key/value pair returned by a prefix scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl StoredEntry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Key rendered for logs and error messages.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// Minimal contract the migration pass needs from the backing store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Return every entry whose key starts with `prefix`, in store key order.
    async fn scan(&self, prefix: &str) -> Result<Vec<StoredEntry>, StoreError>;

    /// Write a single key, overwriting any existing value. Returns once acknowledged.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Builds a connected store handle.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: KvStore;

    /// Short name used for logging.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Self::Store, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    writes: Vec<String>,
    fail_scan: Option<String>,
    fail_put: Option<String>,
}

/// Ordered in-memory store for tests and dry smoke runs.
/// Clones share state, so a test can keep a handle while the migrator owns another.
/// Seeding and inspection helpers keep working on a poisoned lock; `scan` and `put`
/// report it as a store error.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry without recording it as a write.
    pub fn insert(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.state().entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.state().entries.get(key).cloned()
    }

    /// Keys passed to `put`, in call order.
    pub fn writes(&self) -> Vec<String> {
        self.state().writes.clone()
    }

    /// Snapshot of all stored entries in key order.
    pub fn snapshot(&self) -> Vec<StoredEntry> {
        self.state()
            .entries
            .iter()
            .map(|(k, v)| StoredEntry::new(k.clone(), v.clone()))
            .collect()
    }

    /// Make every subsequent scan fail with `reason`.
    pub fn fail_scans(&self, reason: impl Into<String>) {
        self.state().fail_scan = Some(reason.into());
    }

    /// Make puts to `key` fail.
    pub fn fail_put_on(&self, key: impl Into<String>) {
        self.state().fail_put = Some(key.into());
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, String> {
        self.inner.lock().map_err(|err| format!("lock poisoned: {err}"))
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn scan(&self, prefix: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let state = self.lock().map_err(|reason| StoreError::Scan {
            prefix: prefix.to_string(),
            reason,
        })?;
        if let Some(reason) = &state.fail_scan {
            return Err(StoreError::Scan {
                prefix: prefix.to_string(),
                reason: reason.clone(),
            });
        }

        let start = prefix.as_bytes().to_vec();
        Ok(state
            .entries
            .range(start..)
            .take_while(|(k, _)| k.starts_with(prefix.as_bytes()))
            .map(|(k, v)| StoredEntry::new(k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.lock().map_err(|reason| StoreError::Write {
            key: key.to_string(),
            reason,
        })?;
        if state.fail_put.as_deref() == Some(key) {
            return Err(StoreError::Write {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        state.writes.push(key.to_string());
        state.entries.insert(key.as_bytes().to_vec(), value.to_vec());
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for InMemoryKvStore {
    type Store = InMemoryKvStore;

    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> Result<Self::Store, StoreError> {
        Ok(self.clone())
    }
}
