//! Anchor backend implementations.

pub mod distributed;
pub mod local;

pub use distributed::{
    DistributedLedgerBackend, InMemoryLedgerClient, LedgerClient, LedgerTransaction,
    TransactionInfo,
};
pub use local::{AnchorRecord, ChainVerification, LocalAnchorBackend};
