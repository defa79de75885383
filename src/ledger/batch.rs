//! Committed batches.

use crate::anchor::AnchorResult;
use crate::core::{Hash256, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A committed batch of entries and its Merkle root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: u64,
    pub root: Hash256,
    /// Entry hashes in leaf order
    pub entry_hashes: Vec<Hash256>,
    pub committed_at: Timestamp,
    /// Anchor outcomes keyed by backend name
    #[serde(default)]
    pub anchors: BTreeMap<String, AnchorResult>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.entry_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_hashes.is_empty()
    }

    /// Whether any backend anchored the root.
    pub fn is_anchored(&self) -> bool {
        self.anchors.values().any(AnchorResult::is_success)
    }
}
