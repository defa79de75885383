//! Pipeline routing configuration.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Messages scoring at or above this are deliberated
    pub impact_threshold: f64,
    /// Messages scoring at or above this also go straight to human review
    pub human_review_threshold: f64,
    /// Deliberated messages need the configured vote quorum
    pub require_multi_agent_vote: bool,
    /// Bound on the whole shutdown sequence (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            impact_threshold: 0.8,
            human_review_threshold: 0.95,
            require_multi_agent_vote: true,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("impact_threshold", self.impact_threshold),
            ("human_review_threshold", self.human_review_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "pipeline.{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}
