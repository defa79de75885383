//! Anchoring requests, receipts and results.

use crate::core::{now, Hash256, Timestamp};
use serde::{Deserialize, Serialize};

/// Status of an anchoring attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorStatus {
    /// Queued, not yet attempted
    Pending,
    /// Accepted by the backend, not yet final
    Submitted,
    /// Final on the backend
    Confirmed,
    /// Every eligible backend failed
    Failed,
}

impl AnchorStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AnchorStatus::Submitted | AnchorStatus::Confirmed)
    }
}

impl std::fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnchorStatus::Pending => write!(f, "pending"),
            AnchorStatus::Submitted => write!(f, "submitted"),
            AnchorStatus::Confirmed => write!(f, "confirmed"),
            AnchorStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A Merkle root to be anchored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorRequest {
    pub root_hash: Hash256,
    pub batch_id: u64,
    pub metadata: serde_json::Value,
}

impl AnchorRequest {
    pub fn new(root_hash: Hash256, batch_id: u64, metadata: serde_json::Value) -> Self {
        Self {
            root_hash,
            batch_id,
            metadata,
        }
    }
}

/// What a backend returns for an accepted anchor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorReceipt {
    /// Backend transaction / record ID
    pub transaction_id: String,
    /// `Submitted` or `Confirmed`
    pub status: AnchorStatus,
    /// Backend-specific block metadata
    pub block_info: Option<serde_json::Value>,
}

/// Outcome of anchoring one root. Immutable once `completed_at` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorResult {
    /// Backend that produced the result
    pub backend: String,
    pub status: AnchorStatus,
    pub root_hash: Hash256,
    pub batch_id: u64,
    pub transaction_id: Option<String>,
    pub block_info: Option<serde_json::Value>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub error: Option<String>,
}

impl AnchorResult {
    pub(crate) fn from_receipt(
        backend: &str,
        request: &AnchorRequest,
        receipt: AnchorReceipt,
        started_at: Timestamp,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            status: receipt.status,
            root_hash: request.root_hash,
            batch_id: request.batch_id,
            transaction_id: Some(receipt.transaction_id),
            block_info: receipt.block_info,
            started_at,
            completed_at: Some(now()),
            error: None,
        }
    }

    pub(crate) fn failed(
        backend: &str,
        request: &AnchorRequest,
        error: String,
        started_at: Timestamp,
    ) -> Self {
        Self {
            backend: backend.to_string(),
            status: AnchorStatus::Failed,
            root_hash: request.root_hash,
            batch_id: request.batch_id,
            transaction_id: None,
            block_info: None,
            started_at,
            completed_at: Some(now()),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Receives the result of a queued anchor request.
pub trait AnchorCallback: Send + Sync {
    fn on_anchor_complete(&self, result: &AnchorResult);
}

/// Health of one backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Connected,
    Degraded,
    Unhealthy,
}
