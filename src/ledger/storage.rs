//! Ledger persistence.
//!
//! The whole ledger is stored as one JSON document under a key in a
//! key-value store, or in a file replaced atomically on each write.

use crate::core::{write_file_atomic, Error, Hash256, Result, Timestamp};
use crate::ledger::entry::AuditEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Minimal key-value store interface.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
}

/// In-process key-value store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    data: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("write to {} rejected", key)));
        }
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// One committed batch as stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub root: Hash256,
    pub entries: Vec<AuditEntry>,
    pub committed_at: Timestamp,
}

/// Full persisted ledger state.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedLedger {
    pub batch_counter: u64,
    pub batches: BTreeMap<u64, PersistedBatch>,
}

/// Where the ledger is persisted.
#[derive(Clone, Default)]
pub enum LedgerPersistence {
    #[default]
    Disabled,
    File(PathBuf),
    KeyValue {
        store: Arc<dyn KeyValueStore>,
        key: String,
    },
}

impl LedgerPersistence {
    pub const DEFAULT_KEY: &'static str = "agora:audit_ledger";

    pub fn key_value(store: Arc<dyn KeyValueStore>) -> Self {
        LedgerPersistence::KeyValue {
            store,
            key: Self::DEFAULT_KEY.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, LedgerPersistence::Disabled)
    }

    /// Load persisted state. `None` if nothing has been written yet.
    pub async fn load(&self) -> Result<Option<PersistedLedger>> {
        let bytes = match self {
            LedgerPersistence::Disabled => return Ok(None),
            LedgerPersistence::File(path) => match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            },
            LedgerPersistence::KeyValue { store, key } => match store.get(key).await? {
                Some(bytes) => bytes,
                None => return Ok(None),
            },
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub async fn save(&self, state: &PersistedLedger) -> Result<()> {
        match self {
            LedgerPersistence::Disabled => Ok(()),
            LedgerPersistence::File(path) => {
                write_file_atomic(path, &serde_json::to_vec(state)?).await
            }
            LedgerPersistence::KeyValue { store, key } => {
                store.set(key, serde_json::to_vec(state)?).await
            }
        }
    }
}

impl std::fmt::Debug for LedgerPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerPersistence::Disabled => write!(f, "Disabled"),
            LedgerPersistence::File(path) => write!(f, "File({})", path.display()),
            LedgerPersistence::KeyValue { key, .. } => write!(f, "KeyValue({})", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::now;
    use tempfile::tempdir;

    fn state() -> PersistedLedger {
        let entry = AuditEntry::new(serde_json::json!({"n": 1})).unwrap();
        let mut state = PersistedLedger {
            batch_counter: 1,
            ..Default::default()
        };
        state.batches.insert(
            1,
            PersistedBatch {
                root: entry.hash,
                entries: vec![entry],
                committed_at: now(),
            },
        );
        state
    }

    #[tokio::test]
    async fn test_disabled() {
        let persistence = LedgerPersistence::Disabled;
        persistence.save(&state()).await.unwrap();
        assert!(persistence.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_value_round_trip() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let persistence = LedgerPersistence::key_value(store.clone());
        assert!(persistence.load().await.unwrap().is_none());

        persistence.save(&state()).await.unwrap();
        let loaded = persistence.load().await.unwrap().unwrap();
        assert_eq!(loaded.batch_counter, 1);
        assert_eq!(loaded.batches[&1].entries.len(), 1);

        store.set_fail_writes(true);
        assert!(persistence.save(&state()).await.is_err());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempdir().unwrap();
        let persistence = LedgerPersistence::File(dir.path().join("ledger").join("state.json"));
        assert!(persistence.load().await.unwrap().is_none());

        persistence.save(&state()).await.unwrap();
        let loaded = persistence.load().await.unwrap().unwrap();
        assert_eq!(loaded.batches.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(LedgerPersistence::File(path).load().await.is_err());
    }
}
