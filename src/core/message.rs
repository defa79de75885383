//! Governance messages flowing through the pipeline.
//!
//! The agent framework that produces these messages is external; only the
//! fields the deliberation and ledger stages read are modelled here.

use crate::core::{now, Timestamp};
use serde::{Deserialize, Serialize};

/// A message proposing an action that may need governance review.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernanceMessage {
    /// Unique message ID
    pub message_id: String,
    /// Sending agent
    pub from_agent: String,
    /// Receiving agent, if addressed
    pub to_agent: Option<String>,
    /// Message kind (e.g. "command", "governance_request")
    pub message_type: String,
    /// Opaque action payload
    pub content: serde_json::Value,
    /// Impact score assigned upstream, if already scored
    pub impact_score: Option<f64>,
    /// Creation timestamp
    pub created_at: Timestamp,
}

impl GovernanceMessage {
    /// Create a new message with a generated ID.
    pub fn new(from_agent: &str, message_type: &str, content: serde_json::Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            from_agent: from_agent.to_string(),
            to_agent: None,
            message_type: message_type.to_string(),
            content,
            impact_score: None,
            created_at: now(),
        }
    }

    /// Address the message to an agent.
    pub fn to(mut self, agent: &str) -> Self {
        self.to_agent = Some(agent.to_string());
        self
    }

    /// Attach an upstream impact score.
    pub fn with_impact_score(mut self, score: f64) -> Self {
        self.impact_score = Some(score.clamp(0.0, 1.0));
        self
    }
}
