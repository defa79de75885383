//! Anchor manager configuration.
//!
//! Configuration-driven backend selection, in priority order.

use crate::anchor::backend::BackendKind;
use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Anchor manager configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Backends in priority order
    pub backends: Vec<BackendConfig>,
    /// Try the next backend when one fails
    pub enable_failover: bool,
    /// Cap on backends attempted per request (default: all)
    pub max_attempts: Option<usize>,
    /// Worker pool size
    pub worker_count: usize,
    /// Bounded request queue capacity
    pub queue_capacity: usize,
    /// Per-attempt timeout (milliseconds)
    pub attempt_timeout_ms: u64,
    /// Number of recent results retained for stats
    pub recent_results: usize,
    /// Grace period for workers to drain on stop (milliseconds)
    pub shutdown_timeout_ms: u64,
    /// Circuit breaker settings, shared by all backends
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendConfig::local("local")],
            enable_failover: true,
            max_attempts: None,
            worker_count: 2,
            queue_capacity: 100,
            attempt_timeout_ms: 30_000,
            recent_results: 100,
            shutdown_timeout_ms: 10_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl AnchorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Enabled backends, in priority order.
    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }

    /// Check invariants. No enabled backend is a startup error.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_backends().next().is_none() {
            return Err(Error::NoAnchorBackends);
        }
        if self.worker_count == 0 {
            return Err(Error::InvalidConfig("anchor.worker_count must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("anchor.queue_capacity must be at least 1".into()));
        }
        let mut names = std::collections::HashSet::new();
        for backend in self.enabled_backends() {
            if !names.insert(backend.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate anchor backend name {}",
                    backend.name
                )));
            }
        }
        Ok(())
    }
}

/// One configured backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name
    pub name: String,
    /// Backend type
    pub kind: BackendKind,
    /// Disabled backends are skipped by the factory
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local-specific config
    #[serde(default)]
    pub local: Option<LocalAnchorConfig>,
    /// Network-specific config
    #[serde(default)]
    pub network: Option<NetworkConfig>,
}

fn default_true() -> bool {
    true
}

impl BackendConfig {
    /// In-memory local backend.
    pub fn local(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: BackendKind::Local,
            enabled: true,
            local: Some(LocalAnchorConfig::default()),
            network: None,
        }
    }

    /// Distributed-ledger backend.
    pub fn network(name: &str, kind: BackendKind, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            local: None,
            network: Some(NetworkConfig {
                endpoint: endpoint.to_string(),
                ..Default::default()
            }),
        }
    }
}

/// Local backend configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LocalAnchorConfig {
    /// JSON-lines mirror of the anchor chain
    pub path: Option<PathBuf>,
    /// Hex-encoded Ed25519 seed. If absent, a random seed is generated and,
    /// when `path` is set, kept in `<path>.key` so the chain survives restarts
    pub signing_key_hex: Option<String>,
}

/// Distributed-ledger backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// RPC / gateway endpoint
    pub endpoint: String,
    /// Chain or channel identifier
    pub chain_id: Option<String>,
    /// Confirmations before a result is reported `Confirmed`
    pub required_confirmations: u64,
    /// Ping latency above which the backend is `Degraded` (milliseconds)
    pub degraded_latency_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8545".to_string(),
            chain_id: None,
            required_confirmations: 1,
            degraded_latency_ms: 2_000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub fail_max: u32,
    /// Cooldown before a half-open trial (milliseconds)
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 3,
            reset_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}
