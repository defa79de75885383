//! Governance pipeline.
//!
//! Routes each message through the policy guard and impact scorer, then
//! either records it in the audit ledger or opens a deliberation task.
//! Resolved deliberations are written back to the ledger.

use crate::anchor::{create_backends, BlockchainAnchorManager, LedgerClients};
use crate::config::GovernanceConfig;
use crate::core::{GovernanceMessage, Hash256, Result};
use crate::deliberation::{DeliberationQueue, DeliberationTask, EnqueueOptions, OutcomeSink, TaskStatus};
use crate::ledger::{AuditLedger, ValidationResult};
use crate::pipeline::collaborators::{ImpactScorer, PolicyDecision, PolicyGuard};
use crate::pipeline::config::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to a processed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Blocked by policy and recorded as invalid
    Denied { entry_hash: Hash256, reason: String },
    /// Opened a deliberation task
    Deliberating { task_id: String, impact_score: f64 },
    /// Low impact, recorded as valid
    Recorded { entry_hash: Hash256, impact_score: f64 },
}

/// Writes resolved deliberations to the audit ledger.
pub struct LedgerOutcomeSink {
    ledger: Arc<AuditLedger>,
}

impl LedgerOutcomeSink {
    pub fn new(ledger: Arc<AuditLedger>) -> Self {
        Self { ledger }
    }
}

/// Ledger payload for a resolved task.
pub fn task_outcome(task: &DeliberationTask) -> ValidationResult {
    let mut result = match task.status {
        TaskStatus::Approved => ValidationResult::valid(),
        TaskStatus::Rejected if task.human_decision.is_some() => {
            ValidationResult::invalid(["rejected by human reviewer"])
        }
        TaskStatus::Rejected => ValidationResult::invalid(["rejected by agent consensus"]),
        TaskStatus::TimedOut => ValidationResult::invalid(["deliberation timed out"]),
        TaskStatus::Pending | TaskStatus::UnderReview => {
            ValidationResult::invalid(["deliberation unresolved"])
        }
    };
    result = result
        .for_task(&task.task_id)
        .for_message(&task.message.message_id)
        .with_metadata("stage", "deliberation")
        .with_metadata("status", &task.status)
        .with_metadata("from_agent", &task.message.from_agent)
        .with_metadata("message_type", &task.message.message_type)
        .with_metadata("vote_count", task.votes.len());
    if let Some(consensus) = &task.consensus {
        result = result.with_metadata("consensus", consensus);
    }
    if let Some(reviewer) = &task.human_reviewer {
        result = result
            .with_metadata("human_reviewer", reviewer)
            .with_metadata("human_decision", &task.human_decision)
            .with_metadata("human_reasoning", &task.human_reasoning);
    }
    result
}

impl OutcomeSink for LedgerOutcomeSink {
    fn on_resolved(&self, task: &DeliberationTask) {
        match self.ledger.add_validation_result(&task_outcome(task)) {
            Ok(hash) => debug!(task_id = %task.task_id, entry = %hash, "Deliberation outcome recorded"),
            Err(e) => error!(task_id = %task.task_id, error = %e, "Failed to record deliberation outcome"),
        }
    }
}

/// Wires the deliberation queue, audit ledger and anchor manager together.
pub struct GovernancePipeline {
    config: PipelineConfig,
    scorer: Arc<dyn ImpactScorer>,
    policy: Arc<dyn PolicyGuard>,
    queue: DeliberationQueue,
    ledger: Arc<AuditLedger>,
}

impl GovernancePipeline {
    pub fn new(
        config: PipelineConfig,
        queue: DeliberationQueue,
        ledger: Arc<AuditLedger>,
        scorer: Arc<dyn ImpactScorer>,
        policy: Arc<dyn PolicyGuard>,
    ) -> Result<Self> {
        config.validate()?;
        queue.set_outcome_sink(Arc::new(LedgerOutcomeSink::new(ledger.clone())));
        Ok(Self {
            config,
            scorer,
            policy,
            queue,
            ledger,
        })
    }

    /// Build every component from configuration. Distributed-ledger
    /// backends need a client in `clients`.
    pub async fn from_config(
        config: &GovernanceConfig,
        scorer: Arc<dyn ImpactScorer>,
        policy: Arc<dyn PolicyGuard>,
        clients: &LedgerClients,
    ) -> Result<Self> {
        config.validate()?;
        let backends = create_backends(&config.anchor, clients).await?;
        let anchor = BlockchainAnchorManager::new(config.anchor.clone(), backends)?;
        let ledger = AuditLedger::from_config(config.ledger.clone(), Some(anchor))?;
        let queue = DeliberationQueue::new(config.deliberation.clone())?;
        Self::new(config.pipeline.clone(), queue, Arc::new(ledger), scorer, policy)
    }

    pub fn queue(&self) -> &DeliberationQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &Arc<AuditLedger> {
        &self.ledger
    }

    pub fn anchor_manager(&self) -> Option<&BlockchainAnchorManager> {
        self.ledger.anchor_manager()
    }

    /// Route one message.
    pub async fn process(&self, message: GovernanceMessage) -> Result<PipelineOutcome> {
        let context = serde_json::json!({
            "message_id": message.message_id,
            "from_agent": message.from_agent,
            "to_agent": message.to_agent,
            "message_type": message.message_type,
        });
        let decision = match self.policy.evaluate(&message.content, &context).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Policy evaluation failed, denying");
                PolicyDecision::deny(&format!("policy evaluation failed: {}", e))
            }
        };

        if !decision.allowed {
            let result = ValidationResult::invalid([decision.reason.clone()])
                .for_message(&message.message_id)
                .with_metadata("stage", "policy")
                .with_metadata("from_agent", &message.from_agent)
                .with_metadata("message_type", &message.message_type);
            let entry_hash = self.ledger.add_validation_result(&result)?;
            info!(message_id = %message.message_id, reason = %decision.reason, "Message denied by policy");
            return Ok(PipelineOutcome::Denied {
                entry_hash,
                reason: decision.reason,
            });
        }

        let impact_score = match message.impact_score {
            Some(score) => score,
            None => match self.scorer.score(&message).await {
                Ok(score) => score.clamp(0.0, 1.0),
                Err(e) => {
                    warn!(message_id = %message.message_id, error = %e, "Impact scoring failed, deliberating");
                    1.0
                }
            },
        };

        if impact_score >= self.config.impact_threshold {
            let mut options = EnqueueOptions::new();
            if self.config.require_multi_agent_vote {
                options = options.multi_agent_vote();
            }
            if impact_score >= self.config.human_review_threshold {
                options = options.human_review();
            }
            let task_id = self
                .queue
                .enqueue(message.with_impact_score(impact_score), options)
                .await?;
            return Ok(PipelineOutcome::Deliberating {
                task_id,
                impact_score,
            });
        }

        let result = ValidationResult::valid()
            .for_message(&message.message_id)
            .with_metadata("stage", "fast_lane")
            .with_metadata("impact_score", impact_score)
            .with_metadata("from_agent", &message.from_agent)
            .with_metadata("message_type", &message.message_type);
        let entry_hash = self.ledger.add_validation_result(&result)?;
        debug!(message_id = %message.message_id, impact_score, "Message recorded without deliberation");
        Ok(PipelineOutcome::Recorded {
            entry_hash,
            impact_score,
        })
    }

    /// Start components in dependency order: anchor, ledger, queue.
    pub async fn start(&self) -> Result<()> {
        if let Some(anchor) = self.anchor_manager() {
            anchor.start();
        }
        self.ledger.start().await?;
        self.queue.start();
        info!(
            impact_threshold = self.config.impact_threshold,
            "Governance pipeline started"
        );
        Ok(())
    }

    /// Stop components in reverse order within the shutdown timeout.
    /// Components that have not stopped by then are aborted.
    pub async fn stop(&self) {
        info!("Stopping governance pipeline");
        let shutdown = async {
            self.queue.stop().await;
            self.ledger.stop().await;
            if let Some(anchor) = self.anchor_manager() {
                anchor.stop().await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), shutdown)
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.shutdown_timeout_ms,
                "Governance pipeline shutdown timed out, aborting remaining components"
            );
            self.queue.abort();
            self.ledger.abort();
            if let Some(anchor) = self.anchor_manager() {
                anchor.abort();
            }
        } else {
            info!("Governance pipeline stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Error;
    use crate::deliberation::VoteKind;
    use crate::anchor::{AnchorBackend, AnchorConfig, AnchorReceipt, AnchorRequest, BackendKind};
    use crate::deliberation::DeliberationConfig;
    use crate::ledger::{AnchorMode, LedgerConfig, LedgerPersistence};
    use crate::pipeline::collaborators::{AllowAllPolicy, DenyListPolicy, FixedImpactScorer};
    use std::time::Duration;

    /// Never completes an anchor call.
    struct StalledBackend;

    #[async_trait::async_trait]
    impl AnchorBackend for StalledBackend {
        fn name(&self) -> &str {
            "stalled"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Arweave
        }

        async fn anchor(&self, _request: &AnchorRequest) -> Result<AnchorReceipt> {
            std::future::pending().await
        }

        async fn verify_anchor(&self, _tx: &str, _root: &Hash256) -> Result<bool> {
            Ok(false)
        }
    }

    async fn pipeline(policy: Arc<dyn PolicyGuard>, score: f64) -> GovernancePipeline {
        let mut config = GovernanceConfig::default();
        config.deliberation.min_required_votes = 2;
        let pipeline = GovernancePipeline::from_config(
            &config,
            Arc::new(FixedImpactScorer(score)),
            policy,
            &LedgerClients::new(),
        )
        .await
        .unwrap();
        pipeline.start().await.unwrap();
        pipeline
    }

    fn message(kind: &str) -> GovernanceMessage {
        GovernanceMessage::new("agent-1", kind, serde_json::json!({"action": "scale", "replicas": 3}))
    }

    fn only_entry(pipeline: &GovernancePipeline, batch_id: u64) -> ValidationResult {
        let batch = pipeline.ledger().get_batch(batch_id).unwrap();
        assert_eq!(batch.len(), 1);
        pipeline
            .ledger()
            .get_entry(&batch.entry_hashes[0])
            .unwrap()
            .validation_result()
            .unwrap()
    }

    #[tokio::test]
    async fn test_low_impact_recorded() {
        let pipeline = pipeline(Arc::new(AllowAllPolicy), 0.2).await;
        let outcome = pipeline.process(message("command")).await.unwrap();
        let PipelineOutcome::Recorded { entry_hash, impact_score } = outcome else {
            panic!("expected Recorded, got {:?}", outcome);
        };
        assert_eq!(impact_score, 0.2);

        let batch_id = pipeline.ledger().flush().await.unwrap().unwrap();
        let result = only_entry(&pipeline, batch_id);
        assert!(result.is_valid);
        assert_eq!(result.metadata["stage"], "fast_lane");
        assert!(pipeline.ledger().verify_stored_entry(&entry_hash));
        assert_eq!(pipeline.queue().get_queue_status().total_tasks, 0);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_policy_denial_recorded_invalid() {
        let pipeline = pipeline(Arc::new(DenyListPolicy::new(["drop_database"])), 0.9).await;
        let outcome = pipeline.process(message("drop_database")).await.unwrap();
        assert!(matches!(outcome, PipelineOutcome::Denied { .. }));

        let batch_id = pipeline.ledger().flush().await.unwrap().unwrap();
        let result = only_entry(&pipeline, batch_id);
        assert!(!result.is_valid);
        assert_eq!(result.metadata["stage"], "policy");
        assert_eq!(pipeline.queue().get_queue_status().total_tasks, 0);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_high_impact_deliberated_and_outcome_recorded() {
        let pipeline = pipeline(Arc::new(AllowAllPolicy), 0.85).await;
        let outcome = pipeline.process(message("command")).await.unwrap();
        let PipelineOutcome::Deliberating { task_id, .. } = outcome else {
            panic!("expected Deliberating, got {:?}", outcome);
        };

        let task = pipeline.queue().get_item_details(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.required_votes, 2);
        assert_eq!(task.message.impact_score, Some(0.85));

        for agent in ["a", "b"] {
            pipeline
                .queue()
                .submit_agent_vote(&task_id, agent, VoteKind::Approve, "ok", 0.9)
                .await
                .unwrap();
        }
        assert_eq!(
            pipeline.queue().get_item_details(&task_id).unwrap().status,
            TaskStatus::Approved
        );

        let batch_id = pipeline.ledger().flush().await.unwrap().unwrap();
        let result = only_entry(&pipeline, batch_id);
        assert!(result.is_valid);
        assert_eq!(result.task_id.as_deref(), Some(task_id.as_str()));
        assert_eq!(result.metadata["vote_count"], 2);

        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_very_high_impact_goes_to_human_review() {
        let pipeline = pipeline(Arc::new(AllowAllPolicy), 0.99).await;
        let PipelineOutcome::Deliberating { task_id, .. } =
            pipeline.process(message("command")).await.unwrap()
        else {
            panic!("expected Deliberating");
        };
        assert_eq!(
            pipeline.queue().get_item_details(&task_id).unwrap().status,
            TaskStatus::UnderReview
        );
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_upstream_score_wins() {
        let pipeline = pipeline(Arc::new(AllowAllPolicy), 0.99).await;
        let outcome = pipeline
            .process(message("command").with_impact_score(0.1))
            .await
            .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Recorded { impact_score, .. } if impact_score == 0.1));
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_pipeline_rejects() {
        let pipeline = pipeline(Arc::new(AllowAllPolicy), 0.9).await;
        pipeline.stop().await;

        assert!(matches!(
            pipeline.process(message("command")).await,
            Err(Error::QueueStopped)
        ));
        assert!(matches!(
            pipeline.process(message("command").with_impact_score(0.1)).await,
            Err(Error::LedgerStopped)
        ));
        assert!(pipeline.anchor_manager().unwrap().is_stopped());
    }

    #[tokio::test]
    async fn test_stop_timeout_aborts_remaining_components() {
        let backend: Arc<dyn AnchorBackend> = Arc::new(StalledBackend);
        let anchor = BlockchainAnchorManager::new(AnchorConfig::default(), vec![backend]).unwrap();
        let ledger = AuditLedger::new(
            LedgerConfig {
                batch_size: 100,
                idle_flush_ms: 60_000,
                anchor_mode: AnchorMode::Sync,
                ..Default::default()
            },
            LedgerPersistence::Disabled,
            Some(anchor),
        )
        .unwrap();
        let queue = DeliberationQueue::new(DeliberationConfig::default()).unwrap();
        let config = PipelineConfig {
            shutdown_timeout_ms: 100,
            ..Default::default()
        };
        let pipeline = GovernancePipeline::new(
            config,
            queue,
            Arc::new(ledger),
            Arc::new(FixedImpactScorer(0.1)),
            Arc::new(AllowAllPolicy),
        )
        .unwrap();
        pipeline.start().await.unwrap();
        pipeline.process(message("command")).await.unwrap();

        // the final commit blocks on the stalled backend
        tokio::time::timeout(Duration::from_secs(2), pipeline.stop())
            .await
            .unwrap();
        assert!(pipeline.queue().is_stopped());
        assert!(!pipeline.ledger().is_running());
        assert!(pipeline.anchor_manager().unwrap().is_stopped());
    }
}
