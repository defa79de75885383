//! Audit entry structure.
//!
//! Validation results are the payload; the entry hash is SHA3-256 over the
//! payload's canonical JSON.

use crate::core::{canonical_json, now, Hash256, Result, Timestamp};
use crate::ledger::merkle::{verify_proof, MerkleProof};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of validating a governance message or decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Message the result refers to
    pub message_id: Option<String>,
    /// Deliberation task the result refers to
    pub task_id: Option<String>,
    pub produced_at: Timestamp,
}

impl ValidationResult {
    /// A passing result.
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            metadata: BTreeMap::new(),
            message_id: None,
            task_id: None,
            produced_at: now(),
        }
    }

    /// A failing result.
    pub fn invalid<S: Into<String>>(errors: impl IntoIterator<Item = S>) -> Self {
        Self {
            is_valid: false,
            errors: errors.into_iter().map(Into::into).collect(),
            ..Self::valid()
        }
    }

    pub fn with_warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }

    /// Add metadata. Values that fail to serialize are skipped.
    pub fn with_metadata(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.to_string(), v);
        }
        self
    }

    pub fn for_message(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_string());
        self
    }

    pub fn for_task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }
}

/// Hash of a payload's canonical serialization.
pub fn payload_hash(payload: &serde_json::Value) -> Result<Hash256> {
    Ok(Hash256::digest(canonical_json(payload)?.as_bytes()))
}

/// An entry in the audit ledger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub payload: serde_json::Value,
    /// SHA3-256 of the canonical payload
    pub hash: Hash256,
    /// When the entry was accepted
    pub timestamp: Timestamp,
    /// Set when the entry's batch commits
    #[serde(default)]
    pub batch_id: Option<u64>,
    #[serde(default)]
    pub proof: Option<MerkleProof>,
}

impl AuditEntry {
    pub fn new(payload: serde_json::Value) -> Result<Self> {
        let hash = payload_hash(&payload)?;
        Ok(Self {
            payload,
            hash,
            timestamp: now(),
            batch_id: None,
            proof: None,
        })
    }

    /// The payload as a validation result, if it is one.
    pub fn validation_result(&self) -> Option<ValidationResult> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    /// Whether `hash` still matches the payload.
    pub fn hash_matches(&self) -> bool {
        payload_hash(&self.payload)
            .map(|h| h == self.hash)
            .unwrap_or(false)
    }

    /// Verify the entry's own payload against `root`.
    pub fn verify(&self, root: &Hash256) -> bool {
        match (&self.proof, payload_hash(&self.payload)) {
            (Some(proof), Ok(hash)) => verify_proof(&hash, proof, root),
            _ => false,
        }
    }

    pub(crate) fn committed(mut self, batch_id: u64, proof: MerkleProof) -> Self {
        self.batch_id = Some(batch_id);
        self.proof = Some(proof);
        self
    }
}
