//! Weighted quorum consensus evaluation.
//!
//! Pure functions over a vote set; the queue calls these after every
//! accepted vote, and nothing here holds state.

use crate::deliberation::vote::{AgentVote, VoteKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Weight applied to agents absent from the weight map.
pub const DEFAULT_AGENT_WEIGHT: f64 = 1.0;

/// Decision reached by a tally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    /// Approve weight reached the threshold
    Approved,
    /// Reject weight reached the threshold
    Rejected,
    /// Not enough votes, or neither side reached the threshold
    Pending,
}

/// Result of a consensus tally.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    /// Outcome of the tally
    pub decision: ConsensusDecision,
    /// Whether `votes >= required_votes`
    pub quorum_met: bool,
    /// Sum of approving weight
    pub approve_weight: f64,
    /// Sum of rejecting weight
    pub reject_weight: f64,
    /// Sum of non-abstaining weight
    pub counted_weight: f64,
    /// approve_weight / max(counted_weight, 1)
    pub approve_ratio: f64,
    /// reject_weight / max(counted_weight, 1)
    pub reject_ratio: f64,
    /// Number of votes cast, abstentions included
    pub vote_count: usize,
    /// Number of abstentions
    pub abstain_count: usize,
}

/// Stateless evaluator for weighted quorum votes.
pub struct ConsensusEvaluator;

impl ConsensusEvaluator {
    /// Weight of an agent, falling back to [`DEFAULT_AGENT_WEIGHT`].
    /// Negative weights count as zero.
    pub fn weight_of(agent_id: &str, weights: &HashMap<String, f64>) -> f64 {
        weights
            .get(agent_id)
            .copied()
            .unwrap_or(DEFAULT_AGENT_WEIGHT)
            .max(0.0)
    }

    /// Tally votes against a threshold.
    ///
    /// Abstentions count toward the vote count but neither the numerator
    /// nor the denominator. Approval is checked before rejection, and both
    /// use `>=` against the threshold.
    pub fn evaluate(
        votes: &[AgentVote],
        weights: &HashMap<String, f64>,
        required_votes: usize,
        threshold: f64,
    ) -> ConsensusResult {
        let mut approve_weight = 0.0;
        let mut reject_weight = 0.0;
        let mut abstain_count = 0;

        for vote in votes {
            let weight = Self::weight_of(&vote.agent_id, weights);
            match vote.vote {
                VoteKind::Approve => approve_weight += weight,
                VoteKind::Reject => reject_weight += weight,
                VoteKind::Abstain => abstain_count += 1,
            }
        }

        let counted_weight = approve_weight + reject_weight;
        let denominator = counted_weight.max(1.0);
        let approve_ratio = approve_weight / denominator;
        let reject_ratio = reject_weight / denominator;
        let quorum_met = votes.len() >= required_votes;

        let decision = if !quorum_met {
            ConsensusDecision::Pending
        } else if approve_ratio >= threshold {
            ConsensusDecision::Approved
        } else if reject_ratio >= threshold {
            ConsensusDecision::Rejected
        } else {
            ConsensusDecision::Pending
        };

        ConsensusResult {
            decision,
            quorum_met,
            approve_weight,
            reject_weight,
            counted_weight,
            approve_ratio,
            reject_ratio,
            vote_count: votes.len(),
            abstain_count,
        }
    }
}
