//! Partitioned in-memory task store.
//!
//! The task map is split across a fixed number of partitions, each behind
//! its own lock. A task always lives in the partition selected by hashing
//! its ID, so mutations of unrelated tasks do not contend.

use crate::deliberation::task::{DeliberationTask, TaskStatus};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock};

type Partition = RwLock<HashMap<String, DeliberationTask>>;

/// Task map guarded by partition locks.
pub struct PartitionedTaskStore {
    partitions: Vec<Partition>,
}

impl PartitionedTaskStore {
    /// Create a store with `count` partitions (at least one).
    pub fn new(count: usize) -> Self {
        let partitions = (0..count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { partitions }
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition owning a task ID. `DefaultHasher::new()` uses fixed keys,
    /// so the mapping is stable for the life of the process.
    pub fn partition_of(&self, task_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        task_id.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    fn partition(&self, task_id: &str) -> &Partition {
        &self.partitions[self.partition_of(task_id)]
    }

    /// Insert or overwrite a task.
    pub fn insert(&self, task: DeliberationTask) {
        let mut partition = self
            .partition(&task.task_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        partition.insert(task.task_id.clone(), task);
    }

    /// Clone of a task.
    pub fn get(&self, task_id: &str) -> Option<DeliberationTask> {
        let partition = self
            .partition(task_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        partition.get(task_id).cloned()
    }

    /// Status of a task without cloning it.
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let partition = self
            .partition(task_id)
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        partition.get(task_id).map(|t| t.status)
    }

    /// Run `f` against a task while holding only its partition's write lock.
    pub fn with_task_mut<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut DeliberationTask) -> R,
    ) -> Option<R> {
        let mut partition = self
            .partition(task_id)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        partition.get_mut(task_id).map(f)
    }

    /// Clone every task, taking one partition lock at a time.
    pub fn snapshot(&self) -> Vec<DeliberationTask> {
        let mut tasks = Vec::new();
        for partition in &self.partitions {
            let partition = partition.read().unwrap_or_else(PoisonError::into_inner);
            tasks.extend(partition.values().cloned());
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Total number of tasks.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| p.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks not yet terminal.
    pub fn active_count(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| {
                p.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|t| !t.is_terminal())
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GovernanceMessage;
    use std::sync::Arc;
    use std::time::Duration;

    fn task() -> DeliberationTask {
        DeliberationTask::new(
            GovernanceMessage::new("agent", "command", serde_json::json!({})),
            TaskStatus::Pending,
            0,
            0.5,
            Duration::from_secs(10),
            HashMap::new(),
        )
    }

    #[test]
    fn test_partition_is_deterministic() {
        let store = PartitionedTaskStore::new(4);
        let first = store.partition_of("task-abc");
        for _ in 0..10 {
            assert_eq!(store.partition_of("task-abc"), first);
        }
        assert!(first < 4);
    }

    #[test]
    fn test_zero_partitions_clamped() {
        let store = PartitionedTaskStore::new(0);
        assert_eq!(store.partition_count(), 1);
    }

    #[test]
    fn test_insert_get_mutate() {
        let store = PartitionedTaskStore::new(4);
        let t = task();
        let id = t.task_id.clone();
        store.insert(t);

        assert_eq!(store.status(&id), Some(TaskStatus::Pending));
        store.with_task_mut(&id, |t| t.transition(TaskStatus::UnderReview));
        assert_eq!(store.get(&id).unwrap().status, TaskStatus::UnderReview);
        assert!(store.with_task_mut("missing", |_| ()).is_none());
    }

    #[test]
    fn test_concurrent_inserts_across_threads() {
        let store = Arc::new(PartitionedTaskStore::new(4));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..125 {
                        store.insert(task());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 1000);
        assert_eq!(store.active_count(), 1000);
        assert_eq!(store.snapshot().len(), 1000);
    }
}
