//! Upstream collaborators.
//!
//! Impact scoring and policy evaluation live outside this crate; the
//! pipeline only sees these traits.

use crate::core::{GovernanceMessage, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Scores how consequential a message is, in `[0, 1]`.
#[async_trait]
pub trait ImpactScorer: Send + Sync {
    async fn score(&self, message: &GovernanceMessage) -> Result<f64>;
}

/// Verdict of a policy evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
        }
    }
}

/// Decides whether an action may proceed at all.
#[async_trait]
pub trait PolicyGuard: Send + Sync {
    async fn evaluate(
        &self,
        action: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<PolicyDecision>;
}

/// Returns the same score for every message.
#[derive(Clone, Copy, Debug)]
pub struct FixedImpactScorer(pub f64);

#[async_trait]
impl ImpactScorer for FixedImpactScorer {
    async fn score(&self, _message: &GovernanceMessage) -> Result<f64> {
        Ok(self.0.clamp(0.0, 1.0))
    }
}

/// Allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyGuard for AllowAllPolicy {
    async fn evaluate(
        &self,
        _action: &serde_json::Value,
        _context: &serde_json::Value,
    ) -> Result<PolicyDecision> {
        Ok(PolicyDecision::allow())
    }
}

/// Denies messages whose type is on a deny list.
#[derive(Clone, Debug, Default)]
pub struct DenyListPolicy {
    denied_types: HashSet<String>,
}

impl DenyListPolicy {
    pub fn new<S: Into<String>>(types: impl IntoIterator<Item = S>) -> Self {
        Self {
            denied_types: types.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PolicyGuard for DenyListPolicy {
    async fn evaluate(
        &self,
        _action: &serde_json::Value,
        context: &serde_json::Value,
    ) -> Result<PolicyDecision> {
        let message_type = context["message_type"].as_str().unwrap_or_default();
        if self.denied_types.contains(message_type) {
            Ok(PolicyDecision::deny(&format!(
                "message type {} is not permitted",
                message_type
            )))
        } else {
            Ok(PolicyDecision::allow())
        }
    }
}
