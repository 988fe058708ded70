//! Order-independent Merkle rollup over block hashes
//!
//! Leaves are sorted before pairing and every pair is hashed as
//! `SHA256(min(a, b) || max(a, b))`, so the root depends only on the set of
//! leaves. An odd node at any level is paired with itself.

use sha2::{Digest, Sha256};

use super::hash::Hash256;

/// Hash two sibling nodes in sorted order
pub fn merkle_node_hash(a: &Hash256, b: &Hash256) -> Hash256 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

/// Sorted Merkle tree, stored level by level (level 0 = sorted leaves)
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl MerkleTree {
    /// Build a tree from leaves in any order.
    pub fn from_leaves(leaves: &[Hash256]) -> Self {
        let mut current = leaves.to_vec();
        current.sort_unstable();

        if current.is_empty() {
            return Self { levels: vec![] };
        }

        let mut levels = vec![current.clone()];
        while current.len() > 1 {
            let next: Vec<Hash256> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => merkle_node_hash(left, right),
                    [single] => merkle_node_hash(single, single),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next.clone());
            current = next;
        }

        Self { levels }
    }

    /// Root hash, `None` for an empty tree
    pub fn root(&self) -> Option<Hash256> {
        self.levels.last().and_then(|level| level.first()).copied()
    }

    /// Sorted leaves
    pub fn leaves(&self) -> &[Hash256] {
        self.levels.first().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Sibling path from `leaf` to the root.
    ///
    /// Because pairs are hashed in sorted order, a verifier needs only the
    /// sibling hashes, not their side.
    pub fn proof(&self, leaf: &Hash256) -> Option<Vec<Hash256>> {
        let mut index = self.leaves().binary_search(leaf).ok()?;
        let mut path = Vec::with_capacity(self.levels.len().saturating_sub(1));

        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if index % 2 == 0 {
                level.get(index + 1).unwrap_or(&level[index])
            } else {
                &level[index - 1]
            };
            path.push(*sibling);
            index /= 2;
        }

        Some(path)
    }
}

/// Compute the root for a set of leaves.
pub fn compute_merkle_root(leaves: &[Hash256]) -> Option<Hash256> {
    MerkleTree::from_leaves(leaves).root()
}

/// Verify a sibling path produced by [`MerkleTree::proof`].
pub fn verify_merkle_proof(leaf: &Hash256, path: &[Hash256], root: &Hash256) -> bool {
    let computed = path
        .iter()
        .fold(*leaf, |acc, sibling| merkle_node_hash(&acc, sibling));
    &computed == root
}
