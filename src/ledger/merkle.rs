//! Merkle tree over audit entry hashes.
//!
//! Leaves and interior nodes are hashed with distinct prefixes
//! (`0x00` / `0x01`). An odd node at any level is paired with itself.

use crate::core::{sha3_256_multi, Hash256};
use serde::{Deserialize, Serialize};

const LEAF_PREFIX: &[u8] = &[0x00];
const NODE_PREFIX: &[u8] = &[0x01];

/// Side of the sibling relative to the running hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Left,
    Right,
}

/// One step of a Merkle path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub hash: Hash256,
    pub position: Position,
}

/// Inclusion proof for one entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the entry within its batch
    pub leaf_index: usize,
    /// Sibling path from leaf to root
    pub path: Vec<ProofNode>,
}

/// Hash of an entry as a leaf.
pub fn leaf_hash(entry_hash: &Hash256) -> Hash256 {
    sha3_256_multi(&[LEAF_PREFIX, entry_hash.as_bytes()])
}

fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    sha3_256_multi(&[NODE_PREFIX, left.as_bytes(), right.as_bytes()])
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            node_hash(left, right)
        })
        .collect()
}

/// Complete tree, kept level by level so proofs are cheap.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build from entry hashes. `None` for an empty batch.
    pub fn build(entry_hashes: &[Hash256]) -> Option<Self> {
        if entry_hashes.is_empty() {
            return None;
        }
        let mut levels = vec![entry_hashes.iter().map(leaf_hash).collect::<Vec<_>>()];
        while let Some(level) = levels.last().filter(|l| l.len() > 1) {
            let next = next_level(level);
            levels.push(next);
        }
        Some(Self { levels })
    }

    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or_else(Hash256::zero)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut path = Vec::new();
        let mut i = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling, position) = if i % 2 == 0 {
                (level.get(i + 1).unwrap_or(&level[i]), Position::Right)
            } else {
                (&level[i - 1], Position::Left)
            };
            path.push(ProofNode {
                hash: *sibling,
                position,
            });
            i /= 2;
        }
        Some(MerkleProof {
            leaf_index: index,
            path,
        })
    }

    /// Proofs for every leaf, in order.
    pub fn proofs(&self) -> Vec<MerkleProof> {
        (0..self.leaf_count()).filter_map(|i| self.proof(i)).collect()
    }
}

/// Root over `entry_hashes`; zero for an empty batch.
pub fn compute_root(entry_hashes: &[Hash256]) -> Hash256 {
    MerkleTree::build(entry_hashes)
        .map(|tree| tree.root())
        .unwrap_or_else(Hash256::zero)
}

/// Recompute the root from an entry hash and its proof.
///
/// Sibling positions must agree with `leaf_index`.
pub fn verify_proof(entry_hash: &Hash256, proof: &MerkleProof, root: &Hash256) -> bool {
    let mut current = leaf_hash(entry_hash);
    let mut index = proof.leaf_index;
    for node in &proof.path {
        let expected = if index % 2 == 0 {
            Position::Right
        } else {
            Position::Left
        };
        if node.position != expected {
            return false;
        }
        current = match node.position {
            Position::Left => node_hash(&node.hash, &current),
            Position::Right => node_hash(&current, &node.hash),
        };
        index /= 2;
    }
    index == 0 && &current == root
}
