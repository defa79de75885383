//! Audit ledger configuration.

use crate::core::{Error, Result};
use crate::ledger::storage::LedgerPersistence;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How committed roots are handed to the anchor manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorMode {
    /// Queue the root and move on
    #[default]
    FireAndForget,
    /// Anchor inline before the next batch is processed
    Sync,
}

/// Audit ledger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Entries per batch
    pub batch_size: usize,
    /// Commit a partial batch after this much inactivity (milliseconds)
    pub idle_flush_ms: u64,
    /// Queue depth that triggers a warning
    pub queue_warn_depth: usize,
    pub anchor_mode: AnchorMode,
    /// File persistence; `None` disables it unless a store is supplied
    pub persistence_path: Option<PathBuf>,
    /// Grace period for the batcher to drain on stop (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_flush_ms: 1_000,
            queue_warn_depth: 10_000,
            anchor_mode: AnchorMode::default(),
            persistence_path: None,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl LedgerConfig {
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// File persistence if a path is configured.
    pub fn persistence(&self) -> LedgerPersistence {
        match &self.persistence_path {
            Some(path) => LedgerPersistence::File(path.clone()),
            None => LedgerPersistence::Disabled,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig("ledger.batch_size must be at least 1".into()));
        }
        if self.idle_flush_ms == 0 {
            return Err(Error::InvalidConfig("ledger.idle_flush_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.anchor_mode, AnchorMode::FireAndForget);
        assert!(!config.persistence().is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{"batch_size": 2, "anchor_mode": "sync"}"#).unwrap();
        assert_eq!(config.batch_size, 2);
        assert_eq!(config.anchor_mode, AnchorMode::Sync);
        assert_eq!(config.idle_flush_ms, 1_000);
    }

    #[test]
    fn test_zero_batch_rejected() {
        let config = LedgerConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
