//! Top-level configuration.

use crate::anchor::AnchorConfig;
use crate::core::Result;
use crate::deliberation::DeliberationConfig;
use crate::ledger::LedgerConfig;
use crate::monitoring::LogConfig;
use crate::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for every component. Missing sections take their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    pub deliberation: DeliberationConfig,
    pub ledger: LedgerConfig,
    pub anchor: AnchorConfig,
    pub pipeline: PipelineConfig,
    pub logging: LogConfig,
}

impl GovernanceConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        self.deliberation.validate()?;
        self.ledger.validate()?;
        self.anchor.validate()?;
        self.pipeline.validate()?;
        Ok(())
    }
}
