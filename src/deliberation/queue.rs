//! Deliberation queue.
//!
//! Public API over the partitioned task store: enqueue, agent votes, human
//! decisions and timeout supervision. Each task gets a lightweight
//! supervisor that moves it to `TimedOut` once its window elapses; all
//! supervisors share one cancellation token so `stop` wakes them at once.

use crate::core::{write_file_atomic, Error, GovernanceMessage, Result};
use crate::deliberation::config::{validate_threshold, DeliberationConfig};
use crate::deliberation::consensus::ConsensusDecision;
use crate::deliberation::store::PartitionedTaskStore;
use crate::deliberation::task::{DeliberationTask, HumanDecision, TaskStatus, TaskSummary};
use crate::deliberation::vote::{AgentVote, VoteKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Receives every task exactly once, when it reaches a terminal status.
///
/// Called after all queue locks are released.
pub trait OutcomeSink: Send + Sync {
    fn on_resolved(&self, task: &DeliberationTask);
}

/// Options for enqueuing a message.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Start in `UnderReview` so a human may decide immediately
    pub requires_human_review: bool,
    /// Require the configured minimum number of agent votes
    pub requires_multi_agent_vote: bool,
    /// Deliberation window (defaults to the configured timeout)
    pub timeout: Option<Duration>,
    /// Explicit vote quorum, overriding the multi-agent default
    pub required_votes: Option<usize>,
    /// Explicit consensus threshold
    pub consensus_threshold: Option<f64>,
    /// Per-agent vote weights
    pub agent_weights: HashMap<String, f64>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn human_review(mut self) -> Self {
        self.requires_human_review = true;
        self
    }

    pub fn multi_agent_vote(mut self) -> Self {
        self.requires_multi_agent_vote = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_required_votes(mut self, votes: usize) -> Self {
        self.required_votes = Some(votes);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = Some(threshold);
        self
    }

    pub fn with_weight(mut self, agent_id: &str, weight: f64) -> Self {
        self.agent_weights.insert(agent_id.to_string(), weight);
        self
    }
}

/// Aggregate queue counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub human_decisions: u64,
    pub votes_accepted: u64,
    pub votes_rejected: u64,
    pub persistence_failures: u64,
}

/// Snapshot returned by [`DeliberationQueue::get_queue_status`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Tasks still awaiting a decision
    pub queue_size: usize,
    /// All retained tasks, terminal ones included
    pub total_tasks: usize,
    pub items: Vec<TaskSummary>,
    pub stats: QueueStats,
}

#[derive(Serialize, Deserialize)]
struct PersistedQueue {
    tasks: Vec<DeliberationTask>,
}

struct QueueInner {
    config: DeliberationConfig,
    store: PartitionedTaskStore,
    /// Coarse lock: counters only.
    stats: Mutex<QueueStats>,
    /// Coarse lock: snapshot-and-write of the snapshot file. Holds the
    /// change count covered by the last successful write.
    persist_lock: tokio::sync::Mutex<u64>,
    changes: AtomicU64,
    shutdown: CancellationToken,
    supervisors: TaskTracker,
    abort_handles: Mutex<HashMap<String, AbortHandle>>,
    sink: RwLock<Option<Arc<dyn OutcomeSink>>>,
}

/// Concurrent deliberation queue.
#[derive(Clone)]
pub struct DeliberationQueue {
    inner: Arc<QueueInner>,
}

impl DeliberationQueue {
    /// Create a queue, reloading persisted tasks if a snapshot exists.
    pub fn new(config: DeliberationConfig) -> Result<Self> {
        config.validate()?;

        let store = PartitionedTaskStore::new(config.partitions);
        if let Some(path) = &config.persistence_path {
            for task in load_snapshot(path) {
                store.insert(task);
            }
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                stats: Mutex::new(QueueStats::default()),
                persist_lock: tokio::sync::Mutex::new(0),
                changes: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                supervisors: TaskTracker::new(),
                abort_handles: Mutex::new(HashMap::new()),
                sink: RwLock::new(None),
            }),
        })
    }

    /// Register the sink notified of resolved tasks.
    pub fn set_outcome_sink(&self, sink: Arc<dyn OutcomeSink>) {
        *self.inner.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Resume supervision of reloaded tasks that are still open.
    pub fn start(&self) {
        let open: Vec<(String, Duration)> = self
            .inner
            .store
            .snapshot()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .map(|t| (t.task_id.clone(), t.remaining()))
            .collect();

        let resumed = open
            .into_iter()
            .filter(|(id, window)| self.spawn_supervisor(id, *window))
            .count();

        info!(
            partitions = self.inner.store.partition_count(),
            resumed, "Deliberation queue started"
        );
    }

    /// Whether `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Enqueue using plain flags instead of [`EnqueueOptions`].
    pub async fn enqueue_for_deliberation(
        &self,
        message: GovernanceMessage,
        requires_human_review: bool,
        requires_multi_agent_vote: bool,
        timeout: Duration,
    ) -> Result<String> {
        let options = EnqueueOptions {
            requires_human_review,
            requires_multi_agent_vote,
            timeout: Some(timeout),
            ..Default::default()
        };
        self.enqueue(message, options).await
    }

    /// Create a task for a message and start its timeout supervisor.
    pub async fn enqueue(&self, message: GovernanceMessage, options: EnqueueOptions) -> Result<String> {
        if self.is_stopped() {
            return Err(Error::QueueStopped);
        }

        let threshold = options
            .consensus_threshold
            .unwrap_or(self.inner.config.consensus_threshold);
        validate_threshold(threshold)?;

        let required_votes = options.required_votes.unwrap_or(if options.requires_multi_agent_vote {
            self.inner.config.min_required_votes
        } else {
            0
        });
        let initial = if options.requires_human_review {
            TaskStatus::UnderReview
        } else {
            TaskStatus::Pending
        };
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());

        let task = DeliberationTask::new(
            message,
            initial,
            required_votes,
            threshold,
            timeout,
            options.agent_weights,
        );
        let task_id = task.task_id.clone();
        let message_id = task.message.message_id.clone();
        self.inner.store.insert(task);
        self.inner.bump(|s| s.total_enqueued += 1);

        info!(
            task_id = %task_id,
            message_id = %message_id,
            status = %initial,
            required_votes,
            timeout_ms = timeout.as_millis() as u64,
            "Enqueued for deliberation"
        );

        self.spawn_supervisor(&task_id, timeout);
        self.inner.persist().await;
        Ok(task_id)
    }

    /// Record an agent's vote, replacing any earlier vote by the same agent.
    ///
    /// Returns the task status after the vote. Rejections (unknown task,
    /// terminal task, malformed vote) come back as `Err` rejection kinds.
    pub async fn submit_agent_vote(
        &self,
        task_id: &str,
        agent_id: &str,
        vote: VoteKind,
        reasoning: &str,
        confidence: f64,
    ) -> Result<TaskStatus> {
        let vote = match AgentVote::new(agent_id, vote, reasoning, confidence) {
            Ok(vote) => vote,
            Err(e) => return Err(self.reject_vote(task_id, e)),
        };

        let outcome = self.inner.store.with_task_mut(task_id, |task| {
            if task.is_terminal() {
                return Err(Error::TaskTerminal(task.task_id.clone()));
            }
            task.upsert_vote(vote);
            if task.status == TaskStatus::Pending {
                task.transition(TaskStatus::UnderReview);
            }
            apply_tally(task);
            Ok((task.status, task.is_terminal().then(|| task.clone())))
        });

        let (status, resolved) = match outcome {
            None => return Err(self.reject_vote(task_id, Error::TaskNotFound(task_id.to_string()))),
            Some(Err(e)) => return Err(self.reject_vote(task_id, e)),
            Some(Ok(accepted)) => accepted,
        };

        self.inner.bump(|s| s.votes_accepted += 1);
        debug!(task_id, agent_id, status = %status, "Vote accepted");

        self.inner.persist().await;
        if let Some(task) = resolved {
            self.inner.resolve(&task);
        }
        Ok(status)
    }

    /// Record a human decision. Only accepted while the task is
    /// `UnderReview`; bypasses vote counting.
    pub async fn submit_human_decision(
        &self,
        task_id: &str,
        reviewer: &str,
        decision: HumanDecision,
        reasoning: &str,
    ) -> Result<TaskStatus> {
        let outcome = self.inner.store.with_task_mut(task_id, |task| {
            if task.is_terminal() {
                return Err(Error::TaskTerminal(task.task_id.clone()));
            }
            if task.status != TaskStatus::UnderReview {
                return Err(Error::InvalidStatus {
                    task_id: task.task_id.clone(),
                    status: task.status.to_string(),
                    required: TaskStatus::UnderReview.to_string(),
                });
            }
            task.human_reviewer = Some(reviewer.to_string());
            task.human_decision = Some(decision);
            task.human_reasoning = Some(reasoning.to_string());
            task.transition(decision.status());
            Ok(task.clone())
        });

        let task = match outcome {
            Some(Ok(task)) => task,
            Some(Err(e)) => {
                debug!(task_id, reviewer, error = %e, "Human decision rejected");
                return Err(e);
            }
            None => {
                debug!(task_id, reviewer, "Human decision for unknown task");
                return Err(Error::TaskNotFound(task_id.to_string()));
            }
        };

        self.inner.bump(|s| s.human_decisions += 1);
        info!(task_id, reviewer, decision = ?decision, "Human decision recorded");

        self.inner.persist().await;
        self.inner.resolve(&task);
        Ok(task.status)
    }

    /// Escalate a pending task to human review.
    pub async fn request_human_review(&self, task_id: &str) -> Result<TaskStatus> {
        let outcome = self.inner.store.with_task_mut(task_id, |task| {
            if task.is_terminal() {
                return Err(Error::TaskTerminal(task.task_id.clone()));
            }
            let escalated = task.status == TaskStatus::Pending;
            if escalated {
                task.transition(TaskStatus::UnderReview);
            }
            Ok(escalated)
        });

        match outcome {
            None => Err(Error::TaskNotFound(task_id.to_string())),
            Some(Err(e)) => Err(e),
            Some(Ok(escalated)) => {
                if escalated {
                    info!(task_id, "Escalated to human review");
                    self.inner.persist().await;
                }
                Ok(TaskStatus::UnderReview)
            }
        }
    }

    /// Set an agent's vote weight on an open task and re-tally.
    pub async fn set_agent_weight(&self, task_id: &str, agent_id: &str, weight: f64) -> Result<TaskStatus> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(Error::InvalidVote(format!("weight {} must be finite and >= 0", weight)));
        }

        let outcome = self.inner.store.with_task_mut(task_id, |task| {
            if task.is_terminal() {
                return Err(Error::TaskTerminal(task.task_id.clone()));
            }
            task.agent_weights.insert(agent_id.to_string(), weight);
            if !task.votes.is_empty() {
                apply_tally(task);
            }
            Ok((task.status, task.is_terminal().then(|| task.clone())))
        });

        let (status, resolved) = match outcome {
            None => return Err(Error::TaskNotFound(task_id.to_string())),
            Some(result) => result?,
        };

        self.inner.persist().await;
        if let Some(task) = resolved {
            self.inner.resolve(&task);
        }
        Ok(status)
    }

    /// Queue size, per-task summaries and counters.
    pub fn get_queue_status(&self) -> QueueStatus {
        let tasks = self.inner.store.snapshot();
        QueueStatus {
            queue_size: tasks.iter().filter(|t| !t.is_terminal()).count(),
            total_tasks: tasks.len(),
            items: tasks.iter().map(TaskSummary::from).collect(),
            stats: self.stats(),
        }
    }

    /// Full task state, or `None` if unknown.
    pub fn get_item_details(&self, task_id: &str) -> Option<DeliberationTask> {
        self.inner.store.get(task_id)
    }

    /// Copy of the counters.
    pub fn stats(&self) -> QueueStats {
        self.inner
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop all supervisors and write a final snapshot.
    ///
    /// Supervisors wake on the shared token; any still running after the
    /// grace period are aborted.
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping deliberation queue");
        self.inner.shutdown.cancel();
        self.inner.supervisors.close();

        let grace = self.inner.config.shutdown_timeout();
        if tokio::time::timeout(grace, self.inner.supervisors.wait())
            .await
            .is_err()
        {
            self.abort_supervisors();
        }

        self.inner.persist().await;
        info!(open_tasks = self.inner.store.active_count(), "Deliberation queue stopped");
    }

    /// Stop without waiting for supervisors or writing a final snapshot.
    pub fn abort(&self) {
        self.inner.shutdown.cancel();
        self.inner.supervisors.close();
        self.abort_supervisors();
    }

    fn abort_supervisors(&self) {
        let handles: Vec<AbortHandle> = self
            .inner
            .abort_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, h)| h)
            .collect();
        if !handles.is_empty() {
            warn!(remaining = handles.len(), "Aborting timeout supervisors");
        }
        for handle in handles {
            handle.abort();
        }
    }

    /// Spawn a supervisor unless one is already tracked for the task.
    fn spawn_supervisor(&self, task_id: &str, window: Duration) -> bool {
        let mut handles = self
            .inner
            .abort_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handles.contains_key(task_id) {
            return false;
        }

        let inner = self.inner.clone();
        let id = task_id.to_string();
        let deadline = Instant::now() + window;
        let poll = self.inner.config.poll_interval(window);
        let handle = self
            .inner
            .supervisors
            .spawn(async move { supervise(inner, id, deadline, poll).await });
        handles.insert(task_id.to_string(), handle.abort_handle());
        true
    }

    fn reject_vote(&self, task_id: &str, err: Error) -> Error {
        self.inner.bump(|s| s.votes_rejected += 1);
        debug!(task_id, error = %err, "Vote rejected");
        err
    }
}

/// Re-tally and apply any terminal decision.
fn apply_tally(task: &mut DeliberationTask) {
    match task.tally().decision {
        ConsensusDecision::Approved => task.transition(TaskStatus::Approved),
        ConsensusDecision::Rejected => task.transition(TaskStatus::Rejected),
        ConsensusDecision::Pending => {}
    }
}

/// Timeout supervisor body.
async fn supervise(inner: Arc<QueueInner>, task_id: String, deadline: Instant, poll: Duration) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner.store.status(&task_id) {
            Some(status) if !status.is_terminal() => {}
            _ => break,
        }

        let now = Instant::now();
        if now >= deadline {
            inner.expire(&task_id).await;
            break;
        }

        let wait = poll.min(deadline - now);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    inner
        .abort_handles
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&task_id);
}

impl QueueInner {
    fn bump(&self, f: impl FnOnce(&mut QueueStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    async fn expire(&self, task_id: &str) {
        let expired = self.store.with_task_mut(task_id, |task| {
            if task.is_terminal() {
                return None;
            }
            task.transition(TaskStatus::TimedOut);
            Some(task.clone())
        });

        if let Some(Some(task)) = expired {
            self.persist().await;
            self.resolve(&task);
        }
    }

    /// Count and announce a terminal task.
    fn resolve(&self, task: &DeliberationTask) {
        self.bump(|s| match task.status {
            TaskStatus::Approved => s.approved += 1,
            TaskStatus::Rejected => s.rejected += 1,
            TaskStatus::TimedOut => s.timed_out += 1,
            _ => {}
        });

        info!(
            task_id = %task.task_id,
            status = %task.status,
            votes = task.votes.len(),
            "Deliberation resolved"
        );

        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            sink.on_resolved(task);
        }
    }

    /// Write the snapshot file, if configured. Failures are counted and
    /// logged; the in-memory transition already happened.
    async fn persist(&self) {
        let Some(path) = self.config.persistence_path.as_deref() else {
            return;
        };

        let change = self.changes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut written = self.persist_lock.lock().await;
        // a write that started after this change already covers it
        if *written >= change {
            return;
        }
        let covered = self.changes.load(Ordering::SeqCst);
        let snapshot = PersistedQueue {
            tasks: self.store.snapshot(),
        };
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to serialize deliberation queue");
                self.bump(|s| s.persistence_failures += 1);
                return;
            }
        };
        match write_file_atomic(path, &bytes).await {
            Ok(()) => *written = covered,
            Err(e) => {
                drop(written);
                warn!(path = %path.display(), error = %e, "Failed to persist deliberation queue");
                self.bump(|s| s.persistence_failures += 1);
            }
        }
    }
}

fn load_snapshot(path: &Path) -> Vec<DeliberationTask> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read deliberation snapshot");
            return Vec::new();
        }
    };
    match serde_json::from_str::<PersistedQueue>(&data) {
        Ok(snapshot) => {
            info!(path = %path.display(), tasks = snapshot.tasks.len(), "Reloaded deliberation tasks");
            snapshot.tasks
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Discarding unreadable deliberation snapshot");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    fn message() -> GovernanceMessage {
        GovernanceMessage::new("agent-x", "command", serde_json::json!({"op": "transfer"}))
    }

    fn queue() -> DeliberationQueue {
        DeliberationQueue::new(DeliberationConfig::default()).unwrap()
    }

    #[derive(Default)]
    struct CountingSink {
        resolved: AtomicUsize,
    }

    impl OutcomeSink for CountingSink {
        fn on_resolved(&self, _task: &DeliberationTask) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_enqueue_defaults() {
        let queue = queue();
        let plain = queue.enqueue(message(), EnqueueOptions::new()).await.unwrap();
        let voted = queue
            .enqueue(message(), EnqueueOptions::new().multi_agent_vote())
            .await
            .unwrap();
        let reviewed = queue
            .enqueue(message(), EnqueueOptions::new().human_review())
            .await
            .unwrap();

        let plain = queue.get_item_details(&plain).unwrap();
        assert_eq!(plain.status, TaskStatus::Pending);
        assert_eq!(plain.required_votes, 0);
        assert_eq!(queue.get_item_details(&voted).unwrap().required_votes, 5);
        assert_eq!(
            queue.get_item_details(&reviewed).unwrap().status,
            TaskStatus::UnderReview
        );
        assert_eq!(queue.get_queue_status().queue_size, 3);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_flag_style_enqueue() {
        let queue = queue();
        let id = queue
            .enqueue_for_deliberation(message(), true, true, Duration::from_secs(60))
            .await
            .unwrap();

        let task = queue.get_item_details(&id).unwrap();
        assert_eq!(task.status, TaskStatus::UnderReview);
        assert_eq!(task.required_votes, 5);
        assert_eq!(task.timeout(), Duration::from_secs(60));
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_revote_replaces_prior_vote() {
        let queue = queue();
        let id = queue
            .enqueue(message(), EnqueueOptions::new().with_required_votes(3))
            .await
            .unwrap();

        queue
            .submit_agent_vote(&id, "agent-1", VoteKind::Reject, "risky", 0.7)
            .await
            .unwrap();
        queue
            .submit_agent_vote(&id, "agent-1", VoteKind::Approve, "reconsidered", 0.9)
            .await
            .unwrap();

        let task = queue.get_item_details(&id).unwrap();
        assert_eq!(task.votes.len(), 1);
        assert_eq!(task.votes[0].vote, VoteKind::Approve);
        assert_eq!(task.status, TaskStatus::UnderReview);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_two_of_three_approves() {
        let queue = queue();
        let id = queue
            .enqueue(
                message(),
                EnqueueOptions::new().with_required_votes(3).with_threshold(0.66),
            )
            .await
            .unwrap();

        queue.submit_agent_vote(&id, "a", VoteKind::Approve, "", 1.0).await.unwrap();
        queue.submit_agent_vote(&id, "b", VoteKind::Approve, "", 1.0).await.unwrap();
        let status = queue.submit_agent_vote(&id, "c", VoteKind::Reject, "", 1.0).await.unwrap();

        assert_eq!(status, TaskStatus::Approved);
        assert_eq!(queue.stats().approved, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_weighted_vote_approves() {
        let queue = queue();
        let id = queue
            .enqueue(
                message(),
                EnqueueOptions::new()
                    .with_required_votes(3)
                    .with_threshold(0.6)
                    .with_weight("senior", 5.0)
                    .with_weight("junior1", 1.0)
                    .with_weight("junior2", 1.0),
            )
            .await
            .unwrap();

        queue.submit_agent_vote(&id, "junior1", VoteKind::Reject, "", 1.0).await.unwrap();
        queue.submit_agent_vote(&id, "junior2", VoteKind::Reject, "", 1.0).await.unwrap();
        let status = queue
            .submit_agent_vote(&id, "senior", VoteKind::Approve, "", 1.0)
            .await
            .unwrap();

        assert_eq!(status, TaskStatus::Approved);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_rejection_consensus() {
        let queue = queue();
        let id = queue
            .enqueue(message(), EnqueueOptions::new().with_required_votes(2).with_threshold(0.66))
            .await
            .unwrap();

        queue.submit_agent_vote(&id, "a", VoteKind::Reject, "", 1.0).await.unwrap();
        let status = queue.submit_agent_vote(&id, "b", VoteKind::Reject, "", 1.0).await.unwrap();
        assert_eq!(status, TaskStatus::Rejected);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_freezes_task() {
        let queue = queue();
        let id = queue
            .enqueue(
                message(),
                EnqueueOptions::new()
                    .with_required_votes(10)
                    .with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1400)).await;

        let task = queue.get_item_details(&id).unwrap();
        assert_eq!(task.status, TaskStatus::TimedOut);

        let err = queue
            .submit_agent_vote(&id, "late", VoteKind::Approve, "", 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskTerminal(_)));
        assert!(queue.get_item_details(&id).unwrap().votes.is_empty());
        assert_eq!(queue.stats().timed_out, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_terminal_task_rejects_everything() {
        let queue = queue();
        let id = queue
            .enqueue(message(), EnqueueOptions::new().human_review())
            .await
            .unwrap();

        let status = queue
            .submit_human_decision(&id, "reviewer-1", HumanDecision::Reject, "policy breach")
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Rejected);
        let before = queue.get_item_details(&id).unwrap();

        assert!(queue
            .submit_human_decision(&id, "reviewer-2", HumanDecision::Approve, "override")
            .await
            .is_err());
        assert!(queue
            .submit_agent_vote(&id, "agent-1", VoteKind::Approve, "", 1.0)
            .await
            .is_err());
        assert!(queue.set_agent_weight(&id, "agent-1", 3.0).await.is_err());

        let after = queue.get_item_details(&id).unwrap();
        assert_eq!(after.status, TaskStatus::Rejected);
        assert_eq!(after.human_reviewer.as_deref(), Some("reviewer-1"));
        assert_eq!(after.updated_at, before.updated_at);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_human_decision_requires_review() {
        let queue = queue();
        let id = queue.enqueue(message(), EnqueueOptions::new()).await.unwrap();

        let err = queue
            .submit_human_decision(&id, "reviewer", HumanDecision::Approve, "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatus { .. }));

        queue.request_human_review(&id).await.unwrap();
        let status = queue
            .submit_human_decision(&id, "reviewer", HumanDecision::Approve, "looks fine")
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Approved);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_task_and_bad_vote() {
        let queue = queue();
        let err = queue
            .submit_agent_vote("nope", "a", VoteKind::Approve, "", 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));

        let id = queue.enqueue(message(), EnqueueOptions::new()).await.unwrap();
        let err = queue
            .submit_agent_vote(&id, "a", VoteKind::Approve, "", 2.0)
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(queue.stats().votes_rejected, 2);
        assert!(queue.get_item_details("nope").is_none());
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_weight_change_can_resolve() {
        let queue = queue();
        let id = queue
            .enqueue(message(), EnqueueOptions::new().with_required_votes(2).with_threshold(0.7))
            .await
            .unwrap();
        queue.submit_agent_vote(&id, "a", VoteKind::Approve, "", 1.0).await.unwrap();
        queue.submit_agent_vote(&id, "b", VoteKind::Reject, "", 1.0).await.unwrap();
        assert_eq!(queue.get_item_details(&id).unwrap().status, TaskStatus::UnderReview);

        let status = queue.set_agent_weight(&id, "a", 4.0).await.unwrap();
        assert_eq!(status, TaskStatus::Approved);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_sink_notified_once() {
        let queue = queue();
        let sink = Arc::new(CountingSink::default());
        queue.set_outcome_sink(sink.clone());

        let id = queue
            .enqueue(message(), EnqueueOptions::new().with_required_votes(1).with_threshold(0.5))
            .await
            .unwrap();
        queue.submit_agent_vote(&id, "a", VoteKind::Approve, "", 1.0).await.unwrap();
        let _ = queue.submit_agent_vote(&id, "b", VoteKind::Approve, "", 1.0).await;

        assert_eq!(sink.resolved.load(Ordering::SeqCst), 1);
        queue.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueue_no_lost_writes() {
        let queue = queue();
        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue(message(), EnqueueOptions::new()).await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }

        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert!(queue.get_item_details(id).is_some());
        }
        let status = queue.get_queue_status();
        assert_eq!(status.total_tasks, 1000);
        assert_eq!(status.stats.total_enqueued, 1000);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_timeouts() {
        let queue = queue();
        for _ in 0..10 {
            queue
                .enqueue(message(), EnqueueOptions::new().with_timeout(Duration::from_secs(3600)))
                .await
                .unwrap();
        }

        let started = std::time::Instant::now();
        queue.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        assert!(matches!(
            queue.enqueue(message(), EnqueueOptions::new()).await,
            Err(Error::QueueStopped)
        ));
        // open tasks stay open; shutdown is not a timeout
        assert_eq!(queue.get_queue_status().queue_size, 10);
    }

    #[tokio::test]
    async fn test_snapshot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeliberationConfig {
            persistence_path: Some(dir.path().join("queue.json")),
            ..Default::default()
        };

        let queue = DeliberationQueue::new(config.clone()).unwrap();
        let id = queue
            .enqueue(message(), EnqueueOptions::new().with_required_votes(3))
            .await
            .unwrap();
        queue.submit_agent_vote(&id, "a", VoteKind::Approve, "yes", 0.8).await.unwrap();
        queue.stop().await;

        let reloaded = DeliberationQueue::new(config).unwrap();
        let task = reloaded.get_item_details(&id).unwrap();
        assert_eq!(task.status, TaskStatus::UnderReview);
        assert_eq!(task.votes.len(), 1);
        reloaded.start();
        reloaded.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_changes_reach_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeliberationConfig {
            persistence_path: Some(dir.path().join("queue.json")),
            ..Default::default()
        };
        let queue = DeliberationQueue::new(config.clone()).unwrap();
        let handles: Vec<_> = (0..200)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let id = queue
                        .enqueue(message(), EnqueueOptions::new().with_required_votes(3))
                        .await
                        .unwrap();
                    queue
                        .submit_agent_vote(&id, &format!("agent-{}", i), VoteKind::Approve, "", 0.9)
                        .await
                        .unwrap();
                    id
                })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        // read before stop so the last write came from the concurrent calls
        let persisted: PersistedQueue =
            serde_json::from_slice(&std::fs::read(dir.path().join("queue.json")).unwrap()).unwrap();
        assert_eq!(persisted.tasks.len(), 200);
        assert!(persisted.tasks.iter().all(|t| t.votes.len() == 1));

        queue.stop().await;
        let reloaded = DeliberationQueue::new(config).unwrap();
        for id in &ids {
            assert_eq!(reloaded.get_item_details(id).unwrap().votes.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_unwritable_snapshot_is_logged_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();
        let config = DeliberationConfig {
            persistence_path: Some(blocker.join("queue.json")),
            ..Default::default()
        };

        let queue = DeliberationQueue::new(config).unwrap();
        let id = queue.enqueue(message(), EnqueueOptions::new().human_review()).await.unwrap();
        let status = queue
            .submit_human_decision(&id, "r", HumanDecision::Approve, "")
            .await
            .unwrap();

        assert_eq!(status, TaskStatus::Approved);
        assert!(queue.stats().persistence_failures >= 2);
        queue.stop().await;
    }
}
