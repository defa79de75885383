//! Append-only audit ledger with Merkle batching.
//!
//! Producers push entries onto an unbounded channel and get the entry hash
//! back immediately. A single batcher task owns the open batch: it commits
//! when the batch is full, when the channel has been idle for the idle
//! window, on explicit flush, and on shutdown.

use crate::anchor::{AnchorCallback, AnchorResult, AnchorStats, BlockchainAnchorManager};
use crate::core::{now, Error, Hash256, Result, Timestamp};
use crate::ledger::batch::Batch;
use crate::ledger::config::{AnchorMode, LedgerConfig};
use crate::ledger::entry::{AuditEntry, ValidationResult};
use crate::ledger::merkle::{verify_proof, MerkleProof, MerkleTree};
use crate::ledger::storage::{LedgerPersistence, PersistedBatch, PersistedLedger};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum LedgerCommand {
    Append(AuditEntry),
    Flush(oneshot::Sender<Option<u64>>),
}

/// Ledger statistics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Entries in committed batches
    pub total_entries: u64,
    /// Entries accepted but not yet committed
    pub pending_entries: usize,
    /// Entries in the open batch
    pub current_batch_size: usize,
    pub batch_size: usize,
    pub batches_committed: usize,
    pub last_batch_id: Option<u64>,
    pub last_root: Option<Hash256>,
    pub anchored_batches: usize,
    /// Failed anchor results plus roots the anchor queue refused
    pub anchor_failures: u64,
    pub persistence_failures: u64,
    pub anchor: Option<AnchorStats>,
}

#[derive(Default)]
struct LedgerState {
    entries: HashMap<Hash256, AuditEntry>,
    batches: BTreeMap<u64, Batch>,
}

#[derive(Default)]
struct LedgerCounters {
    total_entries: u64,
    anchor_failures: u64,
    persistence_failures: u64,
}

struct LedgerShared {
    config: LedgerConfig,
    persistence: LedgerPersistence,
    anchor: Option<BlockchainAnchorManager>,
    state: RwLock<LedgerState>,
    counters: Mutex<LedgerCounters>,
    batch_counter: AtomicU64,
    queued: AtomicUsize,
    buffered: AtomicUsize,
}

/// Audit ledger.
pub struct AuditLedger {
    shared: Arc<LedgerShared>,
    sender: mpsc::UnboundedSender<LedgerCommand>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<LedgerCommand>>>,
    batcher: Mutex<Option<JoinHandle<()>>>,
    batcher_abort: Mutex<Option<AbortHandle>>,
    shutdown: CancellationToken,
}

impl AuditLedger {
    pub fn new(
        config: LedgerConfig,
        persistence: LedgerPersistence,
        anchor: Option<BlockchainAnchorManager>,
    ) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(LedgerShared {
                config,
                persistence,
                anchor,
                state: RwLock::new(LedgerState::default()),
                counters: Mutex::new(LedgerCounters::default()),
                batch_counter: AtomicU64::new(0),
                queued: AtomicUsize::new(0),
                buffered: AtomicUsize::new(0),
            }),
            sender,
            receiver: Mutex::new(Some(receiver)),
            batcher: Mutex::new(None),
            batcher_abort: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Ledger using file persistence from `config`, if any.
    pub fn from_config(config: LedgerConfig, anchor: Option<BlockchainAnchorManager>) -> Result<Self> {
        let persistence = config.persistence();
        Self::new(config, persistence, anchor)
    }

    /// Recover persisted batches and start the batcher. Calling twice is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::LedgerStopped);
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(receiver) = receiver else {
            return Ok(());
        };

        self.shared.recover().await;
        let handle = tokio::spawn(run_batcher(
            self.shared.clone(),
            receiver,
            self.shutdown.clone(),
        ));
        *self
            .batcher_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
        *self.batcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(
            batch_size = self.shared.config.batch_size,
            persistence = ?self.shared.persistence,
            anchoring = self.shared.anchor.is_some(),
            "Audit ledger started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
            && self
                .batcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some()
    }

    /// Append a validation result. Returns the entry hash; the entry is
    /// committed asynchronously.
    pub fn add_validation_result(&self, result: &ValidationResult) -> Result<Hash256> {
        self.add_payload(serde_json::to_value(result)?)
    }

    /// Append an arbitrary JSON payload.
    pub fn add_payload(&self, payload: serde_json::Value) -> Result<Hash256> {
        if self.shutdown.is_cancelled() {
            return Err(Error::LedgerStopped);
        }
        let entry = AuditEntry::new(payload)?;
        let hash = entry.hash;

        let depth = self.shared.queued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.sender.send(LedgerCommand::Append(entry)).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::LedgerStopped);
        }
        let warn_depth = self.shared.config.queue_warn_depth;
        if warn_depth > 0 && depth % warn_depth == 0 {
            warn!(depth, "Audit ledger queue is backing up");
        }
        Ok(hash)
    }

    /// Commit the open batch now. Returns the new batch ID, or `None` if
    /// nothing was pending.
    pub async fn flush(&self) -> Result<Option<u64>> {
        if !self.is_running() {
            return Err(Error::LedgerStopped);
        }
        let (ack, done) = oneshot::channel();
        self.sender
            .send(LedgerCommand::Flush(ack))
            .map_err(|_| Error::LedgerStopped)?;
        done.await.map_err(|_| Error::LedgerStopped)
    }

    /// Check `entry_hash` against `root` using `proof`. An entry held by
    /// this ledger must also still match its stored payload.
    pub fn verify_entry(&self, entry_hash: &Hash256, proof: &MerkleProof, root: &Hash256) -> bool {
        let state = self.shared.read_state();
        if let Some(entry) = state.entries.get(entry_hash) {
            if !entry.hash_matches() {
                return false;
            }
        }
        verify_proof(entry_hash, proof, root)
    }

    /// Verify a committed entry against its own batch root.
    pub fn verify_stored_entry(&self, entry_hash: &Hash256) -> bool {
        let state = self.shared.read_state();
        let Some(entry) = state.entries.get(entry_hash) else {
            return false;
        };
        entry
            .batch_id
            .and_then(|id| state.batches.get(&id))
            .map(|batch| entry.verify(&batch.root))
            .unwrap_or(false)
    }

    /// Committed entry for `entry_hash`. Identical payloads share a hash;
    /// the earliest commit is returned.
    pub fn get_entry(&self, entry_hash: &Hash256) -> Option<AuditEntry> {
        self.shared.read_state().entries.get(entry_hash).cloned()
    }

    pub fn get_batch(&self, batch_id: u64) -> Option<Batch> {
        self.shared.read_state().batches.get(&batch_id).cloned()
    }

    /// Proof and batch root for a committed entry.
    pub fn get_proof(&self, entry_hash: &Hash256) -> Option<(MerkleProof, Hash256)> {
        let state = self.shared.read_state();
        let entry = state.entries.get(entry_hash)?;
        let batch = state.batches.get(&entry.batch_id?)?;
        Some((entry.proof.clone()?, batch.root))
    }

    pub fn anchor_manager(&self) -> Option<&BlockchainAnchorManager> {
        self.shared.anchor.as_ref()
    }

    pub fn get_ledger_stats(&self) -> LedgerStats {
        let shared = &self.shared;
        let buffered = shared.buffered.load(Ordering::SeqCst);
        let mut stats = {
            let state = shared.read_state();
            let last = state.batches.values().next_back();
            LedgerStats {
                batches_committed: state.batches.len(),
                last_batch_id: last.map(|b| b.batch_id),
                last_root: last.map(|b| b.root),
                anchored_batches: state.batches.values().filter(|b| b.is_anchored()).count(),
                ..Default::default()
            }
        };
        {
            let counters = shared.counters.lock().unwrap_or_else(PoisonError::into_inner);
            stats.total_entries = counters.total_entries;
            stats.anchor_failures = counters.anchor_failures;
            stats.persistence_failures = counters.persistence_failures;
        }
        stats.pending_entries = shared.queued.load(Ordering::SeqCst) + buffered;
        stats.current_batch_size = buffered;
        stats.batch_size = shared.config.batch_size;
        stats.anchor = shared.anchor.as_ref().map(BlockchainAnchorManager::stats);
        stats
    }

    /// Stop accepting entries, drain the queue and commit what remains.
    pub async fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("Stopping audit ledger");
        self.shutdown.cancel();

        let handle = self
            .batcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(mut handle) => {
                let grace = self.shared.config.shutdown_timeout();
                if tokio::time::timeout(grace, &mut handle).await.is_err() {
                    warn!("Audit ledger batcher did not drain in time, aborting");
                    handle.abort();
                }
            }
            None => {
                let queued = self.shared.queued.load(Ordering::SeqCst);
                if queued > 0 {
                    warn!(queued, "Audit ledger stopped before start, queued entries discarded");
                }
            }
        }

        let stats = self.get_ledger_stats();
        info!(
            entries = stats.total_entries,
            batches = stats.batches_committed,
            "Audit ledger stopped"
        );
    }

    /// Stop without draining. Entries not yet committed are lost.
    pub fn abort(&self) {
        self.shutdown.cancel();
        let handle = self
            .batcher_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let pending = self.shared.queued.load(Ordering::SeqCst)
                + self.shared.buffered.load(Ordering::SeqCst);
            warn!(pending, "Aborting audit ledger batcher");
            handle.abort();
        }
    }
}

async fn run_batcher(
    shared: Arc<LedgerShared>,
    mut receiver: mpsc::UnboundedReceiver<LedgerCommand>,
    shutdown: CancellationToken,
) {
    let idle = shared.config.idle_flush();
    let mut buffer: Vec<AuditEntry> = Vec::with_capacity(shared.config.batch_size);
    loop {
        let command = if buffer.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = receiver.recv() => command,
            }
        } else {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(idle, receiver.recv()) => match received {
                    Ok(command) => command,
                    Err(_) => {
                        debug!(entries = buffer.len(), "Idle window elapsed, committing partial batch");
                        shared.commit(&mut buffer).await;
                        continue;
                    }
                },
            }
        };
        let Some(command) = command else {
            break;
        };
        shared.handle(command, &mut buffer).await;
    }

    receiver.close();
    while let Ok(command) = receiver.try_recv() {
        shared.handle(command, &mut buffer).await;
    }
    shared.commit(&mut buffer).await;
    debug!("Audit ledger batcher exited");
}

/// Records anchor outcomes on the batch they belong to.
struct BatchAnchorRecorder {
    ledger: Weak<LedgerShared>,
}

impl AnchorCallback for BatchAnchorRecorder {
    fn on_anchor_complete(&self, result: &AnchorResult) {
        if let Some(ledger) = self.ledger.upgrade() {
            ledger.record_anchor(result);
        }
    }
}

impl LedgerShared {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, LedgerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, LedgerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, f: impl FnOnce(&mut LedgerCounters)) {
        f(&mut self.counters.lock().unwrap_or_else(PoisonError::into_inner));
    }

    async fn handle(self: &Arc<Self>, command: LedgerCommand, buffer: &mut Vec<AuditEntry>) {
        match command {
            LedgerCommand::Append(entry) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                buffer.push(entry);
                self.buffered.store(buffer.len(), Ordering::SeqCst);
                if buffer.len() >= self.config.batch_size {
                    self.commit(buffer).await;
                }
            }
            LedgerCommand::Flush(ack) => {
                let batch_id = self.commit(buffer).await;
                let _ = ack.send(batch_id);
            }
        }
    }

    async fn commit(self: &Arc<Self>, buffer: &mut Vec<AuditEntry>) -> Option<u64> {
        if buffer.is_empty() {
            return None;
        }
        let entries = std::mem::take(buffer);
        self.buffered.store(0, Ordering::SeqCst);

        let hashes: Vec<Hash256> = entries.iter().map(|e| e.hash).collect();
        let tree = MerkleTree::build(&hashes)?;
        let root = tree.root();
        let batch_id = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let committed_at = now();
        let count = entries.len();

        {
            let mut state = self.write_state();
            // a repeated payload keeps the batch and proof it was first committed with
            for (entry, proof) in entries.into_iter().zip(tree.proofs()) {
                state
                    .entries
                    .entry(entry.hash)
                    .or_insert_with(|| entry.committed(batch_id, proof));
            }
            state.batches.insert(
                batch_id,
                Batch {
                    batch_id,
                    root,
                    entry_hashes: hashes,
                    committed_at,
                    anchors: BTreeMap::new(),
                },
            );
        }
        self.bump(|c| c.total_entries += count as u64);
        info!(batch_id, entries = count, root = %root, "Committed audit batch");

        self.persist().await;
        self.anchor_batch(batch_id, root, count, committed_at).await;
        Some(batch_id)
    }

    fn snapshot(&self) -> PersistedLedger {
        let state = self.read_state();
        let batches = state
            .batches
            .values()
            .map(|batch| {
                let entries = batch
                    .entry_hashes
                    .iter()
                    .filter_map(|h| state.entries.get(h).cloned())
                    .collect();
                (
                    batch.batch_id,
                    PersistedBatch {
                        root: batch.root,
                        entries,
                        committed_at: batch.committed_at,
                    },
                )
            })
            .collect();
        PersistedLedger {
            batch_counter: self.batch_counter.load(Ordering::SeqCst),
            batches,
        }
    }

    async fn persist(&self) {
        if !self.persistence.is_enabled() {
            return;
        }
        let snapshot = self.snapshot();
        if let Err(e) = self.persistence.save(&snapshot).await {
            warn!(error = %e, "Failed to persist audit ledger");
            self.bump(|c| c.persistence_failures += 1);
        }
    }

    async fn anchor_batch(
        self: &Arc<Self>,
        batch_id: u64,
        root: Hash256,
        count: usize,
        committed_at: Timestamp,
    ) {
        let Some(anchor) = &self.anchor else {
            return;
        };
        let metadata = serde_json::json!({
            "entry_count": count,
            "committed_at": committed_at,
        });
        match self.config.anchor_mode {
            AnchorMode::FireAndForget => {
                let recorder = Arc::new(BatchAnchorRecorder {
                    ledger: Arc::downgrade(self),
                });
                if let Err(e) = anchor.anchor_root(root, batch_id, metadata, Some(recorder)) {
                    warn!(batch_id, error = %e, "Batch root not queued for anchoring");
                    self.bump(|c| c.anchor_failures += 1);
                }
            }
            AnchorMode::Sync => {
                let result = anchor.anchor_root_sync(root, batch_id, metadata).await;
                self.record_anchor(&result);
            }
        }
    }

    fn record_anchor(&self, result: &AnchorResult) {
        if !result.is_success() {
            self.bump(|c| c.anchor_failures += 1);
        }
        let mut state = self.write_state();
        match state.batches.get_mut(&result.batch_id) {
            Some(batch) => {
                batch.anchors.insert(result.backend.clone(), result.clone());
            }
            None => warn!(batch_id = result.batch_id, "Anchor result for unknown batch"),
        }
    }

    /// Rebuild state from persistence. Batches whose entries or root do not
    /// verify are skipped.
    async fn recover(&self) {
        let persisted = match self.persistence.load().await {
            Ok(Some(persisted)) => persisted,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted audit ledger, starting empty");
                return;
            }
        };

        let mut max_batch_id = persisted.batch_counter;
        let mut restored_entries = 0u64;
        let mut skipped = 0usize;
        {
            let mut state = self.write_state();
            for (batch_id, batch) in persisted.batches {
                max_batch_id = max_batch_id.max(batch_id);
                match restore_batch(batch_id, batch) {
                    Some((batch, entries)) => {
                        restored_entries += entries.len() as u64;
                        for entry in entries {
                            state.entries.entry(entry.hash).or_insert(entry);
                        }
                        state.batches.insert(batch_id, batch);
                    }
                    None => skipped += 1,
                }
            }
        }
        self.batch_counter.store(max_batch_id, Ordering::SeqCst);
        self.bump(|c| c.total_entries = restored_entries);
        info!(
            entries = restored_entries,
            skipped_batches = skipped,
            batch_counter = max_batch_id,
            "Recovered audit ledger"
        );
    }
}

fn restore_batch(batch_id: u64, persisted: PersistedBatch) -> Option<(Batch, Vec<AuditEntry>)> {
    if let Some(entry) = persisted.entries.iter().find(|e| !e.hash_matches()) {
        error!(batch_id, entry = %entry.hash, "Persisted entry does not match its hash, skipping batch");
        return None;
    }
    let hashes: Vec<Hash256> = persisted.entries.iter().map(|e| e.hash).collect();
    let Some(tree) = MerkleTree::build(&hashes) else {
        warn!(batch_id, "Persisted batch is empty, skipping");
        return None;
    };
    if tree.root() != persisted.root {
        error!(
            batch_id,
            stored = %persisted.root,
            computed = %tree.root(),
            "Persisted batch root mismatch, skipping batch"
        );
        return None;
    }
    let entries = persisted
        .entries
        .into_iter()
        .zip(tree.proofs())
        .map(|(entry, proof)| entry.committed(batch_id, proof))
        .collect();
    Some((
        Batch {
            batch_id,
            root: persisted.root,
            entry_hashes: hashes,
            committed_at: persisted.committed_at,
            anchors: BTreeMap::new(),
        },
        entries,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::{AnchorConfig, AnchorBackend, LocalAnchorBackend};
    use crate::ledger::storage::MemoryKeyValueStore;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(batch_size: usize) -> LedgerConfig {
        LedgerConfig {
            batch_size,
            idle_flush_ms: 60_000,
            ..Default::default()
        }
    }

    fn result(n: usize) -> ValidationResult {
        ValidationResult::valid().with_metadata("n", n)
    }

    async fn wait_for(ledger: &AuditLedger, f: impl Fn(&LedgerStats) -> bool) -> LedgerStats {
        for _ in 0..200 {
            let stats = ledger.get_ledger_stats();
            if f(&stats) {
                return stats;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ledger.get_ledger_stats()
    }

    async fn anchor_manager() -> BlockchainAnchorManager {
        let backend: Arc<dyn AnchorBackend> =
            Arc::new(LocalAnchorBackend::in_memory("local").await.unwrap());
        BlockchainAnchorManager::new(AnchorConfig::default(), vec![backend]).unwrap()
    }

    #[tokio::test]
    async fn test_batch_boundary() {
        let ledger = AuditLedger::new(config(2), LedgerPersistence::Disabled, None).unwrap();
        ledger.start().await.unwrap();
        for i in 0..3 {
            ledger.add_validation_result(&result(i)).unwrap();
        }

        let stats = wait_for(&ledger, |s| s.batches_committed == 1 && s.current_batch_size == 1).await;
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.pending_entries, 1);

        assert_eq!(ledger.flush().await.unwrap(), Some(2));
        let stats = ledger.get_ledger_stats();
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.pending_entries, 0);
        assert_eq!(ledger.flush().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_proofs_verify() {
        let ledger = AuditLedger::new(config(10), LedgerPersistence::Disabled, None).unwrap();
        ledger.start().await.unwrap();
        let hashes: Vec<Hash256> = (0..5)
            .map(|i| ledger.add_validation_result(&result(i)).unwrap())
            .collect();
        let batch_id = ledger.flush().await.unwrap().unwrap();

        let batch = ledger.get_batch(batch_id).unwrap();
        assert_eq!(batch.entry_hashes, hashes);
        for hash in &hashes {
            let (proof, root) = ledger.get_proof(hash).unwrap();
            assert_eq!(root, batch.root);
            assert!(ledger.verify_entry(hash, &proof, &root));
            assert!(ledger.verify_stored_entry(hash));
        }

        let (proof, root) = ledger.get_proof(&hashes[0]).unwrap();
        assert!(!ledger.verify_entry(&hashes[1], &proof, &root));
        assert!(!ledger.verify_entry(&hashes[0], &proof, &Hash256::digest(b"bogus")));
    }

    #[tokio::test]
    async fn test_duplicate_payload_keeps_first_commit() {
        let ledger = AuditLedger::new(config(1), LedgerPersistence::Disabled, None).unwrap();
        ledger.start().await.unwrap();
        let repeated = result(7);
        let first = ledger.add_validation_result(&repeated).unwrap();
        wait_for(&ledger, |s| s.batches_committed == 1).await;
        let second = ledger.add_validation_result(&repeated).unwrap();
        let stats = wait_for(&ledger, |s| s.batches_committed == 2).await;
        assert_eq!(first, second);
        assert_eq!(stats.total_entries, 2);

        let entry = ledger.get_entry(&first).unwrap();
        assert_eq!(entry.batch_id, Some(1));
        let (_, root) = ledger.get_proof(&first).unwrap();
        assert_eq!(root, ledger.get_batch(1).unwrap().root);
        assert!(ledger.verify_stored_entry(&first));
        assert_eq!(ledger.get_batch(2).unwrap().entry_hashes, vec![first]);
    }

    #[tokio::test]
    async fn test_idle_window_commits_partial_batch() {
        let mut cfg = config(100);
        cfg.idle_flush_ms = 50;
        let ledger = AuditLedger::new(cfg, LedgerPersistence::Disabled, None).unwrap();
        ledger.start().await.unwrap();
        ledger.add_validation_result(&result(1)).unwrap();

        let stats = wait_for(&ledger, |s| s.batches_committed == 1).await;
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.pending_entries, 0);
    }

    #[tokio::test]
    async fn test_stop_commits_pending() {
        let ledger = AuditLedger::new(config(100), LedgerPersistence::Disabled, None).unwrap();
        ledger.start().await.unwrap();
        for i in 0..3 {
            ledger.add_validation_result(&result(i)).unwrap();
        }
        ledger.stop().await;

        let stats = ledger.get_ledger_stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.batches_committed, 1);
        assert!(matches!(
            ledger.add_validation_result(&result(9)),
            Err(Error::LedgerStopped)
        ));
        assert!(matches!(ledger.flush().await, Err(Error::LedgerStopped)));
    }

    #[tokio::test]
    async fn test_flush_requires_start() {
        let ledger = AuditLedger::new(config(2), LedgerPersistence::Disabled, None).unwrap();
        assert!(matches!(ledger.flush().await, Err(Error::LedgerStopped)));
    }

    #[tokio::test]
    async fn test_recovery_from_key_value_store() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let first = AuditLedger::new(config(2), LedgerPersistence::key_value(store.clone()), None).unwrap();
        first.start().await.unwrap();
        let hashes: Vec<Hash256> = (0..3)
            .map(|i| first.add_validation_result(&result(i)).unwrap())
            .collect();
        first.stop().await;

        let second = AuditLedger::new(config(2), LedgerPersistence::key_value(store), None).unwrap();
        second.start().await.unwrap();
        let stats = second.get_ledger_stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.batches_committed, 2);
        for hash in &hashes {
            assert!(second.verify_stored_entry(hash));
        }

        second.add_validation_result(&result(10)).unwrap();
        assert_eq!(second.flush().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_recovery_skips_bad_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let first = AuditLedger::new(config(2), LedgerPersistence::File(path.clone()), None).unwrap();
        first.start().await.unwrap();
        for i in 0..4 {
            first.add_validation_result(&result(i)).unwrap();
        }
        first.stop().await;

        let persistence = LedgerPersistence::File(path.clone());
        let mut state = persistence.load().await.unwrap().unwrap();
        state.batches.get_mut(&1).unwrap().root = Hash256::digest(b"forged");
        persistence.save(&state).await.unwrap();

        let second = AuditLedger::new(config(2), LedgerPersistence::File(path), None).unwrap();
        second.start().await.unwrap();
        assert!(second.get_batch(1).is_none());
        assert!(second.get_batch(2).is_some());
        let stats = second.get_ledger_stats();
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.total_entries, 2);

        // numbering continues after the highest persisted batch
        second.add_validation_result(&result(10)).unwrap();
        assert_eq!(second.flush().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_persistence_failure_not_fatal() {
        let store = Arc::new(MemoryKeyValueStore::new());
        store.set_fail_writes(true);
        let ledger = AuditLedger::new(config(10), LedgerPersistence::key_value(store), None).unwrap();
        ledger.start().await.unwrap();
        ledger.add_validation_result(&result(1)).unwrap();

        assert_eq!(ledger.flush().await.unwrap(), Some(1));
        let stats = ledger.get_ledger_stats();
        assert_eq!(stats.persistence_failures, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[tokio::test]
    async fn test_sync_anchoring_records_result() {
        let mut cfg = config(10);
        cfg.anchor_mode = AnchorMode::Sync;
        let ledger = AuditLedger::new(cfg, LedgerPersistence::Disabled, Some(anchor_manager().await)).unwrap();
        ledger.start().await.unwrap();
        ledger.add_validation_result(&result(1)).unwrap();
        let batch_id = ledger.flush().await.unwrap().unwrap();

        let batch = ledger.get_batch(batch_id).unwrap();
        let anchor = &batch.anchors["local"];
        assert!(anchor.is_success());
        assert_eq!(anchor.root_hash, batch.root);
        assert_eq!(ledger.get_ledger_stats().anchored_batches, 1);
    }

    #[tokio::test]
    async fn test_fire_and_forget_anchoring() {
        let manager = anchor_manager().await;
        manager.start();
        let ledger = AuditLedger::new(config(1), LedgerPersistence::Disabled, Some(manager.clone())).unwrap();
        ledger.start().await.unwrap();
        ledger.add_validation_result(&result(1)).unwrap();
        ledger.add_validation_result(&result(2)).unwrap();

        let stats = wait_for(&ledger, |s| s.anchored_batches == 2).await;
        assert_eq!(stats.anchored_batches, 2);
        assert_eq!(stats.anchor.unwrap().succeeded, 2);

        ledger.stop().await;
        manager.stop().await;
    }
}
