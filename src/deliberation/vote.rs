//! Agent votes cast on deliberation tasks.

use crate::core::{now, Error, Result, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteKind {
    /// Approve the action
    Approve,
    /// Reject the action
    Reject,
    /// Abstain from voting
    Abstain,
}

impl std::fmt::Display for VoteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteKind::Approve => write!(f, "approve"),
            VoteKind::Reject => write!(f, "reject"),
            VoteKind::Abstain => write!(f, "abstain"),
        }
    }
}

/// A single vote from an agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentVote {
    /// Voting agent ID
    pub agent_id: String,
    /// Vote kind
    pub vote: VoteKind,
    /// Reasoning for the vote
    pub reasoning: String,
    /// Self-reported confidence (0-1)
    pub confidence: f64,
    /// Vote timestamp
    pub timestamp: Timestamp,
}

impl AgentVote {
    /// Create a validated vote.
    ///
    /// Confidence must lie in [0, 1] and the agent ID must be non-empty.
    pub fn new(agent_id: &str, vote: VoteKind, reasoning: &str, confidence: f64) -> Result<Self> {
        if agent_id.trim().is_empty() {
            return Err(Error::InvalidVote("agent id must not be empty".into()));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::InvalidVote(format!(
                "confidence {} outside [0, 1]",
                confidence
            )));
        }

        Ok(Self {
            agent_id: agent_id.to_string(),
            vote,
            reasoning: reasoning.to_string(),
            confidence,
            timestamp: now(),
        })
    }

    /// Approving vote with full confidence.
    pub fn approve(agent_id: &str) -> Self {
        Self::unchecked(agent_id, VoteKind::Approve)
    }

    /// Rejecting vote with full confidence.
    pub fn reject(agent_id: &str) -> Self {
        Self::unchecked(agent_id, VoteKind::Reject)
    }

    /// Abstention.
    pub fn abstain(agent_id: &str) -> Self {
        Self::unchecked(agent_id, VoteKind::Abstain)
    }

    fn unchecked(agent_id: &str, vote: VoteKind) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            vote,
            reasoning: String::new(),
            confidence: 1.0,
            timestamp: now(),
        }
    }
}
