//! Blockchain anchor manager.
//!
//! Accepts Merkle roots from the ledger, queues them on a bounded channel
//! and lets a pool of workers anchor each root on the first healthy backend
//! in priority order.

use crate::anchor::backend::AnchorBackend;
use crate::anchor::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::anchor::config::AnchorConfig;
use crate::anchor::result::{AnchorCallback, AnchorRequest, AnchorResult, BackendHealth};
use crate::core::{now, Error, Hash256, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Per-backend counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BackendCounters {
    pub successes: u64,
    pub failures: u64,
    pub circuit_state: Option<CircuitState>,
}

/// Anchor manager statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AnchorStats {
    /// Requests accepted onto the queue
    pub queued: u64,
    /// Requests dropped because the queue was full
    pub dropped: u64,
    /// Requests anchored on some backend
    pub succeeded: u64,
    /// Requests where every eligible backend failed
    pub failed: u64,
    /// Backends skipped because their circuit was open
    pub circuit_skips: u64,
    /// Requests waiting for a worker
    pub queue_depth: usize,
    pub backends: BTreeMap<String, BackendCounters>,
}

/// Overall health across backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one backend as seen by the manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: String,
    pub health: BackendHealth,
    pub circuit: CircuitState,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: OverallHealth,
    pub backends: BTreeMap<String, BackendStatus>,
    pub checked_at: Timestamp,
}

struct PendingAnchor {
    request: AnchorRequest,
    callback: Option<Arc<dyn AnchorCallback>>,
}

struct ManagedBackend {
    backend: Arc<dyn AnchorBackend>,
    breaker: CircuitBreaker,
}

struct ManagerInner {
    config: AnchorConfig,
    backends: Vec<ManagedBackend>,
    stats: Mutex<AnchorStats>,
    recent: Mutex<VecDeque<AnchorResult>>,
}

/// Anchors Merkle roots to external backends.
#[derive(Clone)]
pub struct BlockchainAnchorManager {
    inner: Arc<ManagerInner>,
    sender: mpsc::Sender<PendingAnchor>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingAnchor>>>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    worker_handles: Arc<Mutex<Vec<AbortHandle>>>,
}

impl BlockchainAnchorManager {
    /// Create a manager over `backends`, highest priority first.
    pub fn new(config: AnchorConfig, backends: Vec<Arc<dyn AnchorBackend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(Error::NoAnchorBackends);
        }
        if config.worker_count == 0 || config.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "anchor worker_count and queue_capacity must be at least 1".into(),
            ));
        }

        let mut counters = BTreeMap::new();
        let backends: Vec<ManagedBackend> = backends
            .into_iter()
            .map(|backend| {
                counters.insert(backend.name().to_string(), BackendCounters::default());
                ManagedBackend {
                    breaker: CircuitBreaker::new(backend.name(), config.circuit_breaker.clone()),
                    backend,
                }
            })
            .collect();

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        info!(
            backends = backends.len(),
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            "Anchor manager created"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                backends,
                stats: Mutex::new(AnchorStats {
                    backends: counters,
                    ..Default::default()
                }),
                recent: Mutex::new(VecDeque::new()),
            }),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            worker_handles: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Spawn the worker pool. Calling twice is a no-op.
    pub fn start(&self) {
        let mut handles = self
            .worker_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !handles.is_empty() || self.shutdown.is_cancelled() {
            return;
        }
        for worker_id in 0..self.inner.config.worker_count {
            let handle = self.workers.spawn(run_worker(
                worker_id,
                self.inner.clone(),
                self.receiver.clone(),
                self.shutdown.clone(),
            ));
            handles.push(handle.abort_handle());
        }
        info!(workers = handles.len(), "Anchor workers started");
    }

    /// Queue a root for anchoring. Never blocks: a full queue drops the
    /// request and returns `AnchorQueueFull`.
    pub fn anchor_root(
        &self,
        root_hash: Hash256,
        batch_id: u64,
        metadata: serde_json::Value,
        callback: Option<Arc<dyn AnchorCallback>>,
    ) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::AnchorManagerStopped);
        }
        let pending = PendingAnchor {
            request: AnchorRequest::new(root_hash, batch_id, metadata),
            callback,
        };
        match self.sender.try_send(pending) {
            Ok(()) => {
                self.inner.bump(|s| s.queued += 1);
                debug!(batch_id, root = %root_hash, "Anchor request queued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.inner.bump(|s| s.dropped += 1);
                warn!(batch_id, root = %root_hash, "Anchor queue full, dropping request");
                Err(Error::AnchorQueueFull(batch_id))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::AnchorManagerStopped),
        }
    }

    /// Anchor a root on the calling task, bypassing the queue.
    pub async fn anchor_root_sync(
        &self,
        root_hash: Hash256,
        batch_id: u64,
        metadata: serde_json::Value,
    ) -> AnchorResult {
        self.inner
            .execute(AnchorRequest::new(root_hash, batch_id, metadata))
            .await
    }

    /// Query every backend and aggregate.
    pub async fn health_check(&self) -> HealthReport {
        let checks = self.inner.backends.iter().map(|managed| async move {
            let health = match tokio::time::timeout(
                self.inner.config.attempt_timeout(),
                managed.backend.health_check(),
            )
            .await
            {
                Ok(health) => health,
                Err(_) => BackendHealth::Unhealthy,
            };
            let circuit = managed.breaker.state();
            (
                managed.backend.name().to_string(),
                BackendStatus {
                    kind: managed.backend.kind().to_string(),
                    health: if circuit == CircuitState::Open {
                        BackendHealth::Unhealthy
                    } else {
                        health
                    },
                    circuit,
                },
            )
        });
        let backends: BTreeMap<String, BackendStatus> =
            futures::future::join_all(checks).await.into_iter().collect();

        let unhealthy = backends
            .values()
            .filter(|b| b.health == BackendHealth::Unhealthy)
            .count();
        let degraded = backends
            .values()
            .any(|b| b.health == BackendHealth::Degraded);
        let overall = if unhealthy == backends.len() {
            OverallHealth::Unhealthy
        } else if unhealthy > 0 || degraded {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        HealthReport {
            overall,
            backends,
            checked_at: now(),
        }
    }

    pub fn stats(&self) -> AnchorStats {
        let mut stats = self
            .inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.queue_depth = self.inner.config.queue_capacity - self.sender.capacity();
        for managed in &self.inner.backends {
            if let Some(counters) = stats.backends.get_mut(managed.backend.name()) {
                counters.circuit_state = Some(managed.breaker.state());
            }
        }
        stats
    }

    /// Most recent results, oldest first.
    pub fn recent_results(&self) -> Vec<AnchorResult> {
        self.inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Find a backend by name.
    pub fn backend(&self, name: &str) -> Option<Arc<dyn AnchorBackend>> {
        self.inner
            .backends
            .iter()
            .find(|m| m.backend.name() == name)
            .map(|m| m.backend.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop accepting requests and let workers drain the queue within the
    /// shutdown grace period. Workers still running after that are aborted.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping anchor manager");
        self.shutdown.cancel();
        self.workers.close();

        let grace = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(grace, self.workers.wait()).await.is_err() {
            self.abort_workers();
        }
        let stats = self.stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            dropped = stats.dropped,
            "Anchor manager stopped"
        );
    }

    /// Stop without draining. Queued requests are dropped.
    pub fn abort(&self) {
        self.shutdown.cancel();
        self.workers.close();
        self.abort_workers();
    }

    fn abort_workers(&self) {
        let handles: Vec<AbortHandle> = self
            .worker_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !handles.is_empty() {
            warn!(workers = handles.len(), "Aborting anchor workers");
        }
        for handle in handles {
            handle.abort();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    inner: Arc<ManagerInner>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<PendingAnchor>>>,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "Anchor worker running");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            // Queued requests are drained before shutdown is observed.
            tokio::select! {
                biased;
                item = receiver.recv() => item,
                _ = shutdown.cancelled() => receiver.try_recv().ok(),
            }
        };
        let Some(pending) = next else {
            break;
        };
        let result = inner.execute(pending.request).await;
        if let Some(callback) = pending.callback {
            callback.on_anchor_complete(&result);
        }
    }
    debug!(worker_id, "Anchor worker exiting");
}

impl ManagerInner {
    fn bump(&self, f: impl FnOnce(&mut AnchorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn bump_backend(&self, name: &str, success: bool) {
        self.bump(|s| {
            let counters = s.backends.entry(name.to_string()).or_default();
            if success {
                counters.successes += 1;
            } else {
                counters.failures += 1;
            }
        });
    }

    fn remember(&self, result: &AnchorResult) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        recent.push_back(result.clone());
        while recent.len() > self.config.recent_results {
            recent.pop_front();
        }
    }

    /// Try backends in priority order until one succeeds.
    async fn execute(&self, request: AnchorRequest) -> AnchorResult {
        let started_at = now();
        let max_attempts = if self.config.enable_failover {
            self.config.max_attempts.unwrap_or(self.backends.len())
        } else {
            1
        };

        let mut attempts = 0;
        let mut last_error: Option<String> = None;
        for managed in &self.backends {
            if attempts >= max_attempts {
                break;
            }
            let name = managed.backend.name();
            let Some(permit) = managed.breaker.try_acquire() else {
                self.bump(|s| s.circuit_skips += 1);
                debug!(backend = name, batch_id = request.batch_id, "Circuit open, skipping backend");
                continue;
            };
            attempts += 1;

            let outcome = tokio::time::timeout(
                self.config.attempt_timeout(),
                managed.backend.anchor(&request),
            )
            .await;
            let reason = match outcome {
                Ok(Ok(receipt)) => {
                    permit.success();
                    self.bump_backend(name, true);
                    self.bump(|s| s.succeeded += 1);
                    let result = AnchorResult::from_receipt(name, &request, receipt, started_at);
                    info!(
                        backend = name,
                        batch_id = request.batch_id,
                        status = %result.status,
                        tx_id = ?result.transaction_id,
                        "Root anchored"
                    );
                    self.remember(&result);
                    return result;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "timed out after {}ms",
                    self.config.attempt_timeout().as_millis()
                ),
            };

            permit.failure();
            self.bump_backend(name, false);
            warn!(backend = name, batch_id = request.batch_id, error = %reason, "Anchor attempt failed");
            last_error = Some(format!("{}: {}", name, reason));
        }

        let first = self
            .backends
            .first()
            .map(|m| m.backend.name())
            .unwrap_or_default();
        let error = last_error.unwrap_or_else(|| "no backend available (circuits open)".to_string());
        error!(batch_id = request.batch_id, error = %error, "Anchoring failed on all backends");
        self.bump(|s| s.failed += 1);
        let result = AnchorResult::failed(first, &request, error, started_at);
        self.remember(&result);
        result
    }
}
