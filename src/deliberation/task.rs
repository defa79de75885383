//! Deliberation task state.

use crate::core::{now, GovernanceMessage, Timestamp};
use crate::deliberation::consensus::{ConsensusEvaluator, ConsensusResult};
use crate::deliberation::vote::AgentVote;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Lifecycle status of a deliberation task.
///
/// `Pending -> UnderReview -> {Approved, Rejected, TimedOut}`; the three
/// right-hand states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    UnderReview,
    Approved,
    Rejected,
    TimedOut,
}

impl TaskStatus {
    /// Whether no further transition may leave this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Approved | TaskStatus::Rejected | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::UnderReview => write!(f, "under_review"),
            TaskStatus::Approved => write!(f, "approved"),
            TaskStatus::Rejected => write!(f, "rejected"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Decision submitted by a human reviewer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanDecision {
    Approve,
    Reject,
}

impl HumanDecision {
    /// Terminal status this decision produces.
    pub fn status(&self) -> TaskStatus {
        match self {
            HumanDecision::Approve => TaskStatus::Approved,
            HumanDecision::Reject => TaskStatus::Rejected,
        }
    }
}

/// A message under deliberation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliberationTask {
    /// Task ID
    pub task_id: String,
    /// Originating message
    pub message: GovernanceMessage,
    /// Current status
    pub status: TaskStatus,
    /// Votes needed before consensus is evaluated (0 = no quorum)
    pub required_votes: usize,
    /// Approve-weight fraction needed, in (0, 1]
    pub consensus_threshold: f64,
    /// Deliberation window in milliseconds
    pub timeout_ms: u64,
    /// One vote per agent, in first-vote order
    pub votes: Vec<AgentVote>,
    /// Per-agent vote weights (missing agents weigh 1.0)
    pub agent_weights: HashMap<String, f64>,
    /// Creation time
    pub created_at: Timestamp,
    /// Last mutation time
    pub updated_at: Timestamp,
    /// Reviewer who decided, if any
    pub human_reviewer: Option<String>,
    /// Human decision, if any
    pub human_decision: Option<HumanDecision>,
    /// Human reasoning, if any
    pub human_reasoning: Option<String>,
    /// Most recent tally
    pub consensus: Option<ConsensusResult>,
}

impl DeliberationTask {
    pub(crate) fn new(
        message: GovernanceMessage,
        initial_status: TaskStatus,
        required_votes: usize,
        consensus_threshold: f64,
        timeout: Duration,
        agent_weights: HashMap<String, f64>,
    ) -> Self {
        let created_at = now();
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            message,
            status: initial_status,
            required_votes,
            consensus_threshold,
            timeout_ms: timeout.as_millis() as u64,
            votes: Vec::new(),
            agent_weights,
            created_at,
            updated_at: created_at,
            human_reviewer: None,
            human_decision: None,
            human_reasoning: None,
            consensus: None,
        }
    }

    /// Deliberation window.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the task is frozen.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Time left before the deadline, measured from `created_at`.
    pub fn remaining(&self) -> Duration {
        let elapsed = (now() - self.created_at).to_std().unwrap_or_default();
        self.timeout().saturating_sub(elapsed)
    }

    /// Vote cast by an agent, if any.
    pub fn vote_of(&self, agent_id: &str) -> Option<&AgentVote> {
        self.votes.iter().find(|v| v.agent_id == agent_id)
    }

    /// Insert a vote, replacing the agent's earlier vote in place.
    pub(crate) fn upsert_vote(&mut self, vote: AgentVote) {
        match self.votes.iter_mut().find(|v| v.agent_id == vote.agent_id) {
            Some(existing) => *existing = vote,
            None => self.votes.push(vote),
        }
        self.updated_at = now();
    }

    /// Re-tally the current votes.
    pub(crate) fn tally(&mut self) -> &ConsensusResult {
        let result = ConsensusEvaluator::evaluate(
            &self.votes,
            &self.agent_weights,
            self.required_votes,
            self.consensus_threshold,
        );
        self.consensus.insert(result)
    }

    pub(crate) fn transition(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = now();
    }
}

/// Compact view of a task for queue listings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub message_id: String,
    pub status: TaskStatus,
    pub votes: usize,
    pub required_votes: usize,
    pub created_at: Timestamp,
}

impl From<&DeliberationTask> for TaskSummary {
    fn from(task: &DeliberationTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            message_id: task.message.message_id.clone(),
            status: task.status,
            votes: task.votes.len(),
            required_votes: task.required_votes,
            created_at: task.created_at,
        }
    }
}
