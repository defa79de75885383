//! # Agora - Governance Deliberation and Audit
//!
//! Consensus and audit infrastructure for multi-agent systems:
//! - **Deliberation**: partitioned task queue with weighted agent voting,
//!   timeout supervision and human override
//! - **Ledger**: append-only audit log committed in Merkle-rooted batches
//! - **Anchor**: publishes batch roots to local or distributed-ledger
//!   backends with failover and circuit breakers
//! - **Pipeline**: routes messages between policy, deliberation and the ledger
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agora::anchor::LedgerClients;
//! use agora::config::GovernanceConfig;
//! use agora::core::GovernanceMessage;
//! use agora::pipeline::{AllowAllPolicy, FixedImpactScorer, GovernancePipeline};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> agora::Result<()> {
//!     let config = GovernanceConfig::default();
//!     agora::monitoring::init_tracing(&config.logging);
//!
//!     let pipeline = GovernancePipeline::from_config(
//!         &config,
//!         Arc::new(FixedImpactScorer(0.9)),
//!         Arc::new(AllowAllPolicy),
//!         &LedgerClients::new(),
//!     )
//!     .await?;
//!     pipeline.start().await?;
//!
//!     let message = GovernanceMessage::new("agent-1", "command", serde_json::json!({"action": "deploy"}));
//!     println!("{:?}", pipeline.process(message).await?);
//!
//!     pipeline.stop().await;
//!     Ok(())
//! }
//! ```

pub mod anchor;
pub mod config;
pub mod core;
pub mod deliberation;
pub mod ledger;
pub mod monitoring;
pub mod pipeline;

pub use core::error::{Error, Result};
