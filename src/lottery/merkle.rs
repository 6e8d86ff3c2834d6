//! Merkle commitment over the participant set.
//!
//! Participants are sorted by user id, so any party holding the same
//! registration snapshot rebuilds the identical root. Parent nodes hash
//! their children in sorted order, which makes inclusion proofs a bare
//! list of sibling hashes — no left/right directions to carry.

use crate::crypto::{Hash, sha256};

/// Leaf preimage: `userId:weight:index` over the sorted order.
pub fn leaf_hash(user_id: &str, weight: u64, index: usize) -> Hash {
    sha256(format!("{user_id}:{weight}:{index}").as_bytes())
}

/// Order-insensitive pair combine.
fn combine(a: &Hash, b: &Hash) -> Hash {
    let mut buf = [0u8; 64];
    if a <= b {
        buf[..32].copy_from_slice(a);
        buf[32..].copy_from_slice(b);
    } else {
        buf[..32].copy_from_slice(b);
        buf[32..].copy_from_slice(a);
    }
    sha256(&buf)
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// Sorted (user_id, weight) entries, index position = leaf index.
    entries: Vec<(String, u64)>,
    /// levels[0] = leaves, last level = [root].
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build from participant weights. Input order does not matter;
    /// entries are sorted by user id before hashing.
    pub fn build(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut entries: Vec<(String, u64)> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let leaves: Vec<Hash> = entries
            .iter()
            .enumerate()
            .map(|(i, (user, weight))| leaf_hash(user, *weight, i))
            .collect();

        let mut levels = vec![leaves];
        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let prev = levels.last().unwrap();
            let mut next = Vec::with_capacity(prev.len().div_ceil(2));
            for chunk in prev.chunks(2) {
                if chunk.len() == 2 {
                    next.push(combine(&chunk[0], &chunk[1]));
                } else {
                    // odd node duplicates
                    next.push(combine(&chunk[0], &chunk[0]));
                }
            }
            levels.push(next);
        }

        Self { entries, levels }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Root hash. All-zero for an empty participant set.
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Leaf index of a user in the sorted order.
    pub fn index_of(&self, user_id: &str) -> Option<usize> {
        self.entries
            .binary_search_by(|(u, _)| u.as_str().cmp(user_id))
            .ok()
    }

    /// Leaf hash at `index`.
    pub fn leaf(&self, index: usize) -> Option<Hash> {
        self.levels.first().and_then(|l| l.get(index)).copied()
    }

    /// Sibling-hash inclusion proof for the leaf at `index`,
    /// ⌈log₂ N⌉ hashes long.
    pub fn proof(&self, index: usize) -> Option<Vec<Hash>> {
        if index >= self.size() {
            return None;
        }

        let mut proof = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len().saturating_sub(1)] {
            let sibling = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            // duplicated odd node is its own sibling
            let hash = level.get(sibling).copied().unwrap_or(level[idx]);
            proof.push(hash);
            idx /= 2;
        }
        Some(proof)
    }

    /// Sorted entries, leaf order.
    pub fn entries(&self) -> &[(String, u64)] {
        &self.entries
    }
}

/// Recompute the root from a leaf and its sibling path in O(log N).
pub fn verify_proof(leaf: Hash, proof: &[Hash], root: Hash) -> bool {
    let mut acc = leaf;
    for sibling in proof {
        acc = combine(&acc, sibling);
    }
    acc == root
}
