//! Local anchor backend.
//!
//! Each anchored root becomes a signed record linked to its predecessor by
//! hash, optionally mirrored to a JSON-lines file.

use crate::anchor::backend::{AnchorBackend, BackendKind};
use crate::anchor::config::LocalAnchorConfig;
use crate::anchor::result::{AnchorReceipt, AnchorRequest, AnchorStatus, BackendHealth};
use crate::core::{
    canonical_json, now, sha3_256_multi, write_file_atomic, Error, Hash256, Result, Timestamp,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One record in the local anchor chain.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorRecord {
    /// Position in the chain, starting at 0
    pub sequence: u64,
    pub timestamp: Timestamp,
    /// Hash of the previous record (zero for the first)
    pub previous_hash: Hash256,
    pub root_hash: Hash256,
    pub batch_id: u64,
    pub metadata: serde_json::Value,
    /// Content hash of the record
    pub record_hash: Hash256,
    /// Base64 Ed25519 signature over `record_hash`
    pub signature: String,
}

impl AnchorRecord {
    fn new(
        sequence: u64,
        previous_hash: Hash256,
        request: &AnchorRequest,
        key: &SigningKey,
    ) -> Result<Self> {
        let mut record = Self {
            sequence,
            timestamp: now(),
            previous_hash,
            root_hash: request.root_hash,
            batch_id: request.batch_id,
            metadata: request.metadata.clone(),
            record_hash: Hash256::zero(),
            signature: String::new(),
        };
        record.record_hash = record.compute_hash()?;
        record.signature = STANDARD.encode(key.sign(record.record_hash.as_bytes()).to_bytes());
        Ok(record)
    }

    /// Content hash over every field except the hash and signature.
    pub fn compute_hash(&self) -> Result<Hash256> {
        let metadata = canonical_json(&self.metadata)?;
        let timestamp = self.timestamp.to_rfc3339();
        Ok(sha3_256_multi(&[
            &self.sequence.to_le_bytes(),
            timestamp.as_bytes(),
            self.previous_hash.as_bytes(),
            self.root_hash.as_bytes(),
            &self.batch_id.to_le_bytes(),
            metadata.as_bytes(),
        ]))
    }

    /// Check hash, signature and link to `parent`.
    pub fn verify(&self, parent: Option<&AnchorRecord>, key: &VerifyingKey) -> bool {
        match self.compute_hash() {
            Ok(hash) if hash == self.record_hash => {}
            _ => return false,
        }
        if verify_signature(key, &self.record_hash, &self.signature).is_err() {
            return false;
        }
        match parent {
            Some(parent) => {
                self.previous_hash == parent.record_hash && self.sequence == parent.sequence + 1
            }
            None => self.sequence == 0 && self.previous_hash == Hash256::zero(),
        }
    }
}

fn verify_signature(key: &VerifyingKey, hash: &Hash256, signature: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(signature)
        .map_err(|e| Error::InvalidKeyFormat(e.to_string()))?;
    let bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKeyFormat("Invalid signature length".into()))?;
    key.verify(hash.as_bytes(), &Signature::from_bytes(&bytes))?;
    Ok(())
}

/// Result of chain verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub records_verified: u64,
    /// Sequence of the first invalid record (if any)
    pub first_invalid: Option<u64>,
}

fn verify_records(records: &[AnchorRecord], key: &VerifyingKey) -> ChainVerification {
    let mut verification = ChainVerification {
        valid: true,
        records_verified: 0,
        first_invalid: None,
    };
    for (i, record) in records.iter().enumerate() {
        let parent = i.checked_sub(1).and_then(|p| records.get(p));
        if !record.verify(parent, key) {
            verification.valid = false;
            verification.first_invalid = Some(record.sequence);
            break;
        }
        verification.records_verified += 1;
    }
    verification
}

/// Local hash-chained anchor backend.
pub struct LocalAnchorBackend {
    name: String,
    signing_key: SigningKey,
    path: Option<PathBuf>,
    records: RwLock<Vec<AnchorRecord>>,
}

impl LocalAnchorBackend {
    /// Create a backend, reloading the mirror file if one exists.
    pub async fn open(name: &str, config: LocalAnchorConfig) -> Result<Self> {
        let signing_key = match (&config.signing_key_hex, &config.path) {
            (Some(seed), _) => signing_key_from_hex(seed)?,
            (None, Some(path)) => load_or_create_key(name, &key_path(path)).await?,
            (None, None) => random_signing_key(),
        };

        let mut records = Vec::new();
        if let Some(path) = &config.path {
            records = load_records(path).await?;
            let verification = verify_records(&records, &signing_key.verifying_key());
            if !verification.valid {
                warn!(
                    backend = name,
                    first_invalid = ?verification.first_invalid,
                    "Local anchor chain failed verification, keeping valid prefix"
                );
                records.truncate(verification.records_verified as usize);
                rewrite_records(path, &records).await?;
            }
            info!(backend = name, records = records.len(), path = %path.display(), "Loaded local anchor chain");
        }

        Ok(Self {
            name: name.to_string(),
            signing_key,
            path: config.path,
            records: RwLock::new(records),
        })
    }

    /// In-memory backend with a random key.
    pub async fn in_memory(name: &str) -> Result<Self> {
        Self::open(name, LocalAnchorConfig::default()).await
    }

    /// Hex-encoded public key that signs records.
    pub fn verifying_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn records(&self) -> Vec<AnchorRecord> {
        self.records.read().await.clone()
    }

    /// Verify the entire chain.
    pub async fn verify_chain(&self) -> ChainVerification {
        let records = self.records.read().await;
        verify_records(&records, &self.signing_key.verifying_key())
    }

    async fn mirror(&self, record: &AnchorRecord) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

fn signing_key_from_hex(seed: &str) -> Result<SigningKey> {
    let bytes: [u8; 32] = hex::decode(seed.trim())?
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKeyFormat("signing key must be 32 bytes".into()))?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn random_signing_key() -> SigningKey {
    use rand::RngCore;
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    SigningKey::from_bytes(&seed)
}

fn key_path(mirror: &Path) -> PathBuf {
    let mut path = mirror.as_os_str().to_owned();
    path.push(".key");
    PathBuf::from(path)
}

async fn load_or_create_key(name: &str, path: &Path) -> Result<SigningKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(seed) => signing_key_from_hex(&seed),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = random_signing_key();
            write_file_atomic(path, hex::encode(key.to_bytes()).as_bytes()).await?;
            info!(backend = name, path = %path.display(), "Generated local anchor signing key");
            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Replace the mirror with exactly `records`.
async fn rewrite_records(path: &Path, records: &[AnchorRecord]) -> Result<()> {
    let mut content = String::new();
    for record in records {
        content.push_str(&serde_json::to_string(record)?);
        content.push('\n');
    }
    write_file_atomic(path, content.as_bytes()).await
}

async fn load_records(path: &Path) -> Result<Vec<AnchorRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(Error::from))
        .collect()
}

#[async_trait]
impl AnchorBackend for LocalAnchorBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn anchor(&self, request: &AnchorRequest) -> Result<AnchorReceipt> {
        let mut records = self.records.write().await;
        let (sequence, previous_hash) = match records.last() {
            Some(head) => (head.sequence + 1, head.record_hash),
            None => (0, Hash256::zero()),
        };
        let record = AnchorRecord::new(sequence, previous_hash, request, &self.signing_key)?;

        self.mirror(&record)
            .await
            .map_err(|e| Error::backend(&self.name, e.to_string()))?;

        debug!(
            backend = %self.name,
            sequence,
            batch_id = request.batch_id,
            "Anchored root locally"
        );

        let receipt = AnchorReceipt {
            transaction_id: record.record_hash.to_hex(),
            status: AnchorStatus::Confirmed,
            block_info: Some(serde_json::json!({
                "sequence": sequence,
                "previous_hash": previous_hash,
                "public_key": self.verifying_key_hex(),
            })),
        };
        records.push(record);
        Ok(receipt)
    }

    async fn verify_anchor(&self, transaction_id: &str, root_hash: &Hash256) -> Result<bool> {
        let record_hash = Hash256::from_hex(transaction_id)?;
        let records = self.records.read().await;
        let Some(index) = records.iter().position(|r| r.record_hash == record_hash) else {
            return Ok(false);
        };
        let record = &records[index];
        let parent = index.checked_sub(1).and_then(|p| records.get(p));
        Ok(&record.root_hash == root_hash
            && record.verify(parent, &self.signing_key.verifying_key()))
    }

    async fn health_check(&self) -> BackendHealth {
        if self.verify_chain().await.valid {
            BackendHealth::Connected
        } else {
            BackendHealth::Unhealthy
        }
    }
}
