//! Deliberation queue configuration.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Deliberation queue configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliberationConfig {
    /// Number of partition locks guarding the task map
    pub partitions: usize,
    /// Votes required when multi-agent voting is requested
    pub min_required_votes: usize,
    /// Default approve-weight fraction needed for consensus
    pub consensus_threshold: f64,
    /// Default deliberation timeout (seconds)
    pub default_timeout_secs: u64,
    /// Upper bound for the supervisor poll interval (milliseconds)
    pub max_poll_interval_ms: u64,
    /// Grace period for supervisors to exit on stop (milliseconds)
    pub shutdown_timeout_ms: u64,
    /// JSON snapshot of queue state, if persistence is wanted
    pub persistence_path: Option<PathBuf>,
}

impl Default for DeliberationConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            min_required_votes: 5,
            consensus_threshold: 0.66,
            default_timeout_secs: 300,
            max_poll_interval_ms: 1000,
            shutdown_timeout_ms: 5000,
            persistence_path: None,
        }
    }
}

impl DeliberationConfig {
    /// Default deliberation timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// Grace period on stop.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Poll interval for a task with the given timeout: a tenth of the
    /// window, between 10ms and `max_poll_interval_ms`.
    pub fn poll_interval(&self, timeout: Duration) -> Duration {
        let ceiling = Duration::from_millis(self.max_poll_interval_ms.max(10));
        (timeout / 10).clamp(Duration::from_millis(10), ceiling)
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::InvalidConfig(
                "deliberation.partitions must be at least 1".into(),
            ));
        }
        validate_threshold(self.consensus_threshold)
    }
}

/// Thresholds must lie in (0, 1].
pub(crate) fn validate_threshold(threshold: f64) -> Result<()> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "consensus threshold {} outside (0, 1]",
            threshold
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DeliberationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions, 4);
        assert_eq!(config.min_required_votes, 5);
    }

    #[test]
    fn test_invalid_threshold() {
        let config = DeliberationConfig {
            consensus_threshold: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(validate_threshold(1.0).is_ok());
        assert!(validate_threshold(1.01).is_err());
    }

    #[test]
    fn test_poll_interval_bounds() {
        let config = DeliberationConfig::default();
        assert_eq!(config.poll_interval(Duration::from_secs(1)), Duration::from_millis(100));
        assert_eq!(config.poll_interval(Duration::from_millis(5)), Duration::from_millis(10));
        assert_eq!(config.poll_interval(Duration::from_secs(3600)), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json() {
        let config: DeliberationConfig = serde_json::from_str(r#"{"partitions": 8}"#).unwrap();
        assert_eq!(config.partitions, 8);
        assert_eq!(config.consensus_threshold, 0.66);
    }
}
