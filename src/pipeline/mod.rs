//! Message routing between policy, deliberation and the audit ledger.

pub mod collaborators;
pub mod config;
pub mod governance;

pub use collaborators::{
    AllowAllPolicy, DenyListPolicy, FixedImpactScorer, ImpactScorer, PolicyDecision, PolicyGuard,
};
pub use config::PipelineConfig;
pub use governance::{task_outcome, GovernancePipeline, LedgerOutcomeSink, PipelineOutcome};
