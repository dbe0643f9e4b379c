//! Merkle inclusion proofs.

use serde::{Deserialize, Serialize};
use unisync_core::Field;

use crate::hasher::TreeHasher;

/// Inclusion proof of a single leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    /// Root the proof was generated against
    pub root: Field,

    /// Proven leaf value
    pub leaf: Field,

    /// Leaf index
    pub index: usize,

    /// Sibling nodes from the leaf level upwards
    pub siblings: Vec<Field>,

    /// 0 when the path node is a left child, 1 when it is a right child
    pub path_indices: Vec<u8>,
}

impl MerkleProof {
    /// Recompute the root from the leaf and siblings.
    pub fn compute_root<H: TreeHasher>(&self, hasher: &H) -> Field {
        self.siblings
            .iter()
            .zip(&self.path_indices)
            .fold(self.leaf, |node, (sibling, side)| {
                if *side == 0 {
                    hasher.hash_pair(&node, sibling)
                } else {
                    hasher.hash_pair(sibling, &node)
                }
            })
    }

    /// Whether the proof reproduces its claimed root.
    pub fn verify<H: TreeHasher>(&self, hasher: &H) -> bool {
        self.siblings.len() == self.path_indices.len() && self.compute_root(hasher) == self.root
    }
}
