//! AnchorBackend trait definition.
//!
//! Core trait that every external anchoring target implements.

use crate::anchor::result::{AnchorReceipt, AnchorRequest, BackendHealth};
use crate::core::{Hash256, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Backend type identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hash-chained, signed records on local storage
    Local,
    /// EVM-compatible rollup
    EthereumL2,
    /// Solana memo transactions
    Solana,
    /// Arweave permanent storage
    Arweave,
    /// Hyperledger Fabric chaincode
    HyperledgerFabric,
}

impl BackendKind {
    /// Whether the backend talks to an external network.
    pub fn is_distributed(&self) -> bool {
        !matches!(self, BackendKind::Local)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::EthereumL2 => write!(f, "ethereum_l2"),
            BackendKind::Solana => write!(f, "solana"),
            BackendKind::Arweave => write!(f, "arweave"),
            BackendKind::HyperledgerFabric => write!(f, "hyperledger_fabric"),
        }
    }
}

/// Core trait for anchoring backends.
///
/// `anchor` returns `Err` for any failure; the manager turns that into
/// breaker bookkeeping and failover.
#[async_trait]
pub trait AnchorBackend: Send + Sync {
    /// Configured backend name (unique within a manager).
    fn name(&self) -> &str;

    /// Backend type.
    fn kind(&self) -> BackendKind;

    /// Anchor a Merkle root.
    async fn anchor(&self, request: &AnchorRequest) -> Result<AnchorReceipt>;

    /// Check that a transaction exists and commits to `root_hash`.
    async fn verify_anchor(&self, transaction_id: &str, root_hash: &Hash256) -> Result<bool>;

    /// Connectivity check.
    async fn health_check(&self) -> BackendHealth {
        BackendHealth::Connected
    }
}
