//! Binary SHA-256 Merkle tree over leaf-hash strings.
//!
//! Leaves and internal nodes are lowercase hex strings. A parent is
//! `sha256(left || right)` over the hex text of its children. Levels with
//! an odd node count duplicate their last node.

use beacon_protocol::http_types::{ProofDirection, ProofStep};
use sha2::{Digest, Sha256};

/// Field separator for the leaf tuple. No field may contain it.
pub const LEAF_SEP: char = '\x1f';

/// Canonical leaf hash over the entry tuple.
///
/// The tuple is `(log_index, execution_id, job_id, region, provider_id,
/// status, output_hash, receipt_hash, ipfs_cid, prev_hash, timestamp)`
/// joined with `LEAF_SEP` and hashed with SHA-256.
#[allow(clippy::too_many_arguments)]
pub fn leaf_hash(
    log_index: u64,
    execution_id: i64,
    job_id: &str,
    region: &str,
    provider_id: &str,
    status: &str,
    output_hash: &str,
    receipt_hash: &str,
    ipfs_cid: &str,
    prev_hash: &str,
    timestamp_rfc3339: &str,
) -> String {
    let index = log_index.to_string();
    let exec = execution_id.to_string();
    let fields = [
        index.as_str(),
        exec.as_str(),
        job_id,
        region,
        provider_id,
        status,
        output_hash,
        receipt_hash,
        ipfs_cid,
        prev_hash,
        timestamp_rfc3339,
    ];

    let mut joined = String::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            joined.push(LEAF_SEP);
        }
        joined.push_str(field);
    }
    sha256_hex(joined.as_bytes())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn combine(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append-only Merkle tree. Leaves are retained; upper levels are
/// recomputed on demand, which keeps append O(1) and proofs O(n) — the
/// log is read far less often than it is written.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<String>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, leaf: String) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaf(&self, index: usize) -> Option<&str> {
        self.leaves.get(index).map(String::as_str)
    }

    /// Current root. The empty tree has the empty root, which is also the
    /// `prev_hash` of the very first entry.
    pub fn root(&self) -> String {
        if self.leaves.is_empty() {
            return String::new();
        }
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = Self::next_level(&level);
        }
        level.remove(0)
    }

    /// Inclusion proof for the leaf at `index` against the current root.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaves.len() {
            return None;
        }

        let mut steps = Vec::new();
        let mut level = self.leaves.clone();
        let mut pos = index;

        while level.len() > 1 {
            let sibling_pos = if pos % 2 == 0 { pos + 1 } else { pos - 1 };
            // Odd level: the last node pairs with a duplicate of itself.
            let sibling = if sibling_pos < level.len() {
                level[sibling_pos].clone()
            } else {
                level[pos].clone()
            };
            let direction = if pos % 2 == 0 {
                ProofDirection::Right
            } else {
                ProofDirection::Left
            };
            steps.push(ProofStep { sibling, direction });

            level = Self::next_level(&level);
            pos /= 2;
        }

        Some(steps)
    }

    fn next_level(level: &[String]) -> Vec<String> {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(combine(left, right));
        }
        next
    }
}

/// Recompute the root from a leaf and its proof, and compare.
pub fn verify_proof(leaf: &str, proof: &[ProofStep], root: &str) -> bool {
    let mut current = leaf.to_string();
    for step in proof {
        current = match step.direction {
            ProofDirection::Left => combine(&step.sibling, &current),
            ProofDirection::Right => combine(&current, &step.sibling),
        };
    }
    current == root
}
