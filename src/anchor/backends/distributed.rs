//! Distributed-ledger anchor backend.
//!
//! One backend type covers every network kind; network-specific encoding
//! happens here and transport goes through a [`LedgerClient`].

use crate::anchor::backend::{AnchorBackend, BackendKind};
use crate::anchor::config::NetworkConfig;
use crate::anchor::result::{AnchorReceipt, AnchorRequest, AnchorStatus, BackendHealth};
use crate::core::{sha3_256_multi, Error, Hash256, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Transaction handed to a ledger client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub network: BackendKind,
    pub root_hash: Hash256,
    pub batch_id: u64,
    /// Network-specific payload (calldata, memo, tags, chaincode args)
    pub payload: serde_json::Value,
}

/// Inclusion information for a submitted transaction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub transaction_id: String,
    pub block_number: u64,
    pub confirmations: u64,
    pub root_hash: Hash256,
}

/// Transport to a distributed ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a transaction, returning its ID.
    async fn submit(&self, transaction: &LedgerTransaction) -> Result<String>;

    /// Look up a transaction. `None` if unknown.
    async fn transaction(&self, transaction_id: &str) -> Result<Option<TransactionInfo>>;

    /// Round-trip latency to the network.
    async fn ping(&self) -> Result<Duration>;
}

#[derive(Default)]
struct SimulatedChain {
    height: u64,
    transactions: HashMap<String, (u64, Hash256)>,
}

/// In-process ledger: every submission is mined into its own block.
#[derive(Default)]
pub struct InMemoryLedgerClient {
    chain: Mutex<SimulatedChain>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl InMemoryLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: submissions and pings fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Latency reported by `ping`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Advance the chain without new transactions.
    pub fn mine_blocks(&self, count: u64) {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).height += count;
    }

    pub fn height(&self) -> u64 {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner).height
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Internal("ledger network unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedgerClient {
    async fn submit(&self, transaction: &LedgerTransaction) -> Result<String> {
        self.check_available()?;
        let payload = serde_json::to_vec(&transaction.payload)?;
        let mut chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        chain.height += 1;
        let block = chain.height;
        let tx_id = format!(
            "0x{}",
            sha3_256_multi(&[&payload, &block.to_le_bytes()]).to_hex()
        );
        chain
            .transactions
            .insert(tx_id.clone(), (block, transaction.root_hash));
        Ok(tx_id)
    }

    async fn transaction(&self, transaction_id: &str) -> Result<Option<TransactionInfo>> {
        self.check_available()?;
        let chain = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(chain
            .transactions
            .get(transaction_id)
            .map(|(block, root)| TransactionInfo {
                transaction_id: transaction_id.to_string(),
                block_number: *block,
                confirmations: chain.height - block + 1,
                root_hash: *root,
            }))
    }

    async fn ping(&self) -> Result<Duration> {
        self.check_available()?;
        Ok(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
    }
}

/// Anchor backend for a distributed ledger network.
pub struct DistributedLedgerBackend {
    name: String,
    kind: BackendKind,
    config: NetworkConfig,
    client: Arc<dyn LedgerClient>,
}

impl DistributedLedgerBackend {
    pub fn new(
        name: &str,
        kind: BackendKind,
        config: NetworkConfig,
        client: Arc<dyn LedgerClient>,
    ) -> Result<Self> {
        if !kind.is_distributed() {
            return Err(Error::InvalidConfig(format!(
                "backend {} has kind {}, expected a distributed ledger",
                name, kind
            )));
        }
        Ok(Self {
            name: name.to_string(),
            kind,
            config,
            client,
        })
    }

    /// Network-specific encoding of the anchor.
    pub fn encode_payload(&self, request: &AnchorRequest) -> serde_json::Value {
        let root = request.root_hash.to_hex();
        match self.kind {
            // anchor(bytes32,uint64)
            BackendKind::EthereumL2 => serde_json::json!({
                "chain_id": self.config.chain_id,
                "data": format!("0x7c1f9a2e{}{:064x}", root, request.batch_id),
            }),
            BackendKind::Solana => serde_json::json!({
                "memo": format!("agora:anchor:{}:{}", request.batch_id, root),
            }),
            BackendKind::Arweave => serde_json::json!({
                "data": request.metadata,
                "tags": [
                    {"name": "App-Name", "value": "agora"},
                    {"name": "Merkle-Root", "value": root},
                    {"name": "Batch-Id", "value": request.batch_id.to_string()},
                ],
            }),
            BackendKind::HyperledgerFabric => serde_json::json!({
                "channel": self.config.chain_id,
                "chaincode": "audit_anchor",
                "function": "AnchorRoot",
                "args": [root, request.batch_id.to_string()],
            }),
            BackendKind::Local => serde_json::Value::Null,
        }
    }
}

#[async_trait]
impl AnchorBackend for DistributedLedgerBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn anchor(&self, request: &AnchorRequest) -> Result<AnchorReceipt> {
        let transaction = LedgerTransaction {
            network: self.kind,
            root_hash: request.root_hash,
            batch_id: request.batch_id,
            payload: self.encode_payload(request),
        };
        let tx_id = self
            .client
            .submit(&transaction)
            .await
            .map_err(|e| Error::backend(&self.name, e.to_string()))?;

        // Submission succeeded; a failed lookup only downgrades to Submitted.
        let info = match self.client.transaction(&tx_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(backend = %self.name, tx_id = %tx_id, error = %e, "Confirmation lookup failed");
                None
            }
        };
        let confirmations = info.as_ref().map(|i| i.confirmations).unwrap_or(0);
        let status = if confirmations >= self.config.required_confirmations {
            AnchorStatus::Confirmed
        } else {
            AnchorStatus::Submitted
        };

        debug!(
            backend = %self.name,
            network = %self.kind,
            tx_id = %tx_id,
            confirmations,
            "Anchored root on ledger"
        );

        Ok(AnchorReceipt {
            transaction_id: tx_id,
            status,
            block_info: Some(serde_json::json!({
                "network": self.kind,
                "endpoint": self.config.endpoint,
                "chain_id": self.config.chain_id,
                "block_number": info.as_ref().map(|i| i.block_number),
                "confirmations": confirmations,
            })),
        })
    }

    async fn verify_anchor(&self, transaction_id: &str, root_hash: &Hash256) -> Result<bool> {
        let info = self
            .client
            .transaction(transaction_id)
            .await
            .map_err(|e| Error::backend(&self.name, e.to_string()))?;
        Ok(info.map(|i| &i.root_hash == root_hash).unwrap_or(false))
    }

    async fn health_check(&self) -> BackendHealth {
        match self.client.ping().await {
            Ok(latency) if latency.as_millis() as u64 > self.config.degraded_latency_ms => {
                BackendHealth::Degraded
            }
            Ok(_) => BackendHealth::Connected,
            Err(e) => {
                warn!(backend = %self.name, error = %e, "Health check failed");
                BackendHealth::Unhealthy
            }
        }
    }
}
