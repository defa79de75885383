//! Blockchain anchoring.
//!
//! Publishes ledger Merkle roots to one or more external backends with
//! priority failover and per-backend circuit breakers.

pub mod backend;
pub mod backends;
pub mod circuit_breaker;
pub mod config;
pub mod factory;
pub mod manager;
pub mod result;

pub use backend::{AnchorBackend, BackendKind};
pub use backends::{DistributedLedgerBackend, InMemoryLedgerClient, LedgerClient, LocalAnchorBackend};
pub use circuit_breaker::{BreakerPermit, CircuitBreaker, CircuitState};
pub use config::{AnchorConfig, BackendConfig, CircuitBreakerConfig, LocalAnchorConfig, NetworkConfig};
pub use factory::{create_backends, create_backends_simulated, LedgerClients};
pub use manager::{AnchorStats, BlockchainAnchorManager, HealthReport, OverallHealth};
pub use result::{AnchorCallback, AnchorReceipt, AnchorRequest, AnchorResult, AnchorStatus, BackendHealth};
