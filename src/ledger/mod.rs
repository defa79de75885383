//! Audit ledger.
//!
//! Append-only log of validation results, committed in Merkle-rooted
//! batches whose roots are handed to the anchor manager.

pub mod audit;
pub mod batch;
pub mod config;
pub mod entry;
pub mod merkle;
pub mod storage;

pub use audit::{AuditLedger, LedgerStats};
pub use batch::Batch;
pub use config::{AnchorMode, LedgerConfig};
pub use entry::{AuditEntry, ValidationResult};
pub use merkle::{compute_root, verify_proof, MerkleProof, MerkleTree, Position, ProofNode};
pub use storage::{KeyValueStore, LedgerPersistence, MemoryKeyValueStore, PersistedLedger};
