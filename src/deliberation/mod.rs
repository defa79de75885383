//! Deliberation and consensus.
//!
//! High-impact messages become deliberation tasks that agents vote on.
//! A task resolves on weighted consensus, a human decision, or timeout.

pub mod config;
pub mod consensus;
pub mod queue;
pub mod store;
pub mod task;
pub mod vote;

pub use config::DeliberationConfig;
pub use consensus::{ConsensusDecision, ConsensusEvaluator, ConsensusResult};
pub use queue::{DeliberationQueue, EnqueueOptions, OutcomeSink, QueueStats, QueueStatus};
pub use store::PartitionedTaskStore;
pub use task::{DeliberationTask, HumanDecision, TaskStatus, TaskSummary};
pub use vote::{AgentVote, VoteKind};
