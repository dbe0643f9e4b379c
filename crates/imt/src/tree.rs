//! Incremental Merkle tree.

use unisync_core::Field;

use crate::error::{ImtError, Result};
use crate::hasher::{Keccak256Hasher, TreeHasher};
use crate::proof::MerkleProof;

/// Largest supported tree depth.
pub const MAX_DEPTH: u8 = 32;

/// A fixed-depth binary Merkle tree filled left to right.
///
/// Empty slots hold the tree's default leaf; empty subtrees hash to the
/// precomputed zero node of their level. Only the non-empty part of each
/// level is stored.
///
/// # Examples
///
/// ```
/// use unisync_imt::IncrementalMerkleTree;
/// use unisync_core::Field;
///
/// let mut tree = IncrementalMerkleTree::new(4, Field::ZERO).unwrap();
/// let index = tree.insert(Field::from(7u64)).unwrap();
/// assert_eq!(index, 0);
/// let proof = tree.create_proof(index).unwrap();
/// assert_eq!(proof.root, tree.root());
/// ```
#[derive(Debug, Clone)]
pub struct IncrementalMerkleTree<H = Keccak256Hasher> {
    depth: u8,
    /// `zeros[level]` is the root of an empty subtree of height `level`
    zeros: Vec<Field>,
    /// `layers[0]` are leaves, `layers[depth]` holds the root once non-empty
    layers: Vec<Vec<Field>>,
    hasher: H,
}

impl IncrementalMerkleTree<Keccak256Hasher> {
    /// Create an empty keccak256 tree.
    pub fn new(depth: u8, zero_leaf: Field) -> Result<Self> {
        Self::with_hasher(depth, zero_leaf, Keccak256Hasher)
    }
}

impl<H: TreeHasher> IncrementalMerkleTree<H> {
    /// Create an empty tree with a custom node hasher.
    pub fn with_hasher(depth: u8, zero_leaf: Field, hasher: H) -> Result<Self> {
        if depth == 0 || depth > MAX_DEPTH {
            return Err(ImtError::InvalidDepth(depth));
        }

        let mut zeros = Vec::with_capacity(depth as usize + 1);
        zeros.push(zero_leaf);
        for level in 0..depth as usize {
            let z = zeros[level];
            zeros.push(hasher.hash_pair(&z, &z));
        }

        Ok(Self {
            depth,
            zeros,
            layers: vec![Vec::new(); depth as usize + 1],
            hasher,
        })
    }

    /// Tree depth.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Maximum number of leaves.
    pub fn capacity(&self) -> u64 {
        1u64 << self.depth
    }

    /// Number of inserted leaves.
    pub fn len(&self) -> usize {
        self.layers[0].len()
    }

    /// Whether no leaf has been inserted.
    pub fn is_empty(&self) -> bool {
        self.layers[0].is_empty()
    }

    /// Inserted leaves in index order.
    pub fn leaves(&self) -> &[Field] {
        &self.layers[0]
    }

    /// The hasher used by this tree.
    pub fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Current root.
    pub fn root(&self) -> Field {
        self.layers[self.depth as usize]
            .first()
            .copied()
            .unwrap_or(self.zeros[self.depth as usize])
    }

    /// Append a leaf at the next free index and return that index.
    pub fn insert(&mut self, leaf: Field) -> Result<usize> {
        let index = self.len();
        if index as u64 >= self.capacity() {
            return Err(ImtError::TreeFull(self.capacity()));
        }
        self.layers[0].push(leaf);
        self.recompute_path(index);
        Ok(index)
    }

    /// Replace the leaf at an already-inserted index.
    pub fn update(&mut self, index: usize, leaf: Field) -> Result<()> {
        let len = self.len();
        if index >= len {
            return Err(ImtError::IndexOutOfRange { index, len });
        }
        self.layers[0][index] = leaf;
        self.recompute_path(index);
        Ok(())
    }

    /// First index holding `leaf`, if any.
    pub fn index_of(&self, leaf: &Field) -> Option<usize> {
        self.layers[0].iter().position(|l| l == leaf)
    }

    /// Build an inclusion proof for the leaf at `index`.
    pub fn create_proof(&self, index: usize) -> Result<MerkleProof> {
        let len = self.len();
        if index >= len {
            return Err(ImtError::IndexOutOfRange { index, len });
        }

        let mut siblings = Vec::with_capacity(self.depth as usize);
        let mut path_indices = Vec::with_capacity(self.depth as usize);
        let mut idx = index;
        for level in 0..self.depth as usize {
            siblings.push(self.node(level, idx ^ 1));
            path_indices.push((idx & 1) as u8);
            idx >>= 1;
        }

        Ok(MerkleProof {
            root: self.root(),
            leaf: self.layers[0][index],
            index,
            siblings,
            path_indices,
        })
    }

    fn node(&self, level: usize, index: usize) -> Field {
        self.layers[level]
            .get(index)
            .copied()
            .unwrap_or(self.zeros[level])
    }

    fn recompute_path(&mut self, index: usize) {
        let mut idx = index;
        for level in 0..self.depth as usize {
            let (left, right) = if idx & 1 == 0 {
                (self.node(level, idx), self.node(level, idx + 1))
            } else {
                (self.node(level, idx - 1), self.node(level, idx))
            };
            let parent = self.hasher.hash_pair(&left, &right);
            idx >>= 1;

            let next = &mut self.layers[level + 1];
            if idx < next.len() {
                next[idx] = parent;
            } else {
                next.push(parent);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unisync_core::hash_pair;

    fn f(v: u64) -> Field {
        Field::from(v)
    }

    #[test]
    fn test_empty_root_is_zero_chain() {
        let tree = IncrementalMerkleTree::new(2, f(0)).unwrap();
        let z1 = hash_pair(&f(0), &f(0));
        let z2 = hash_pair(&z1, &z1);
        assert_eq!(tree.root(), z2);
        assert!(tree.is_empty());
        assert_eq!(tree.capacity(), 4);
    }

    #[test]
    fn test_root_matches_manual_computation() {
        let mut tree = IncrementalMerkleTree::new(2, f(0)).unwrap();
        tree.insert(f(1)).unwrap();
        tree.insert(f(2)).unwrap();
        tree.insert(f(3)).unwrap();

        let left = hash_pair(&f(1), &f(2));
        let right = hash_pair(&f(3), &f(0));
        assert_eq!(tree.root(), hash_pair(&left, &right));
    }

    #[test]
    fn test_custom_zero_leaf() {
        let mut a = IncrementalMerkleTree::new(3, f(9)).unwrap();
        let b = IncrementalMerkleTree::new(3, f(0)).unwrap();
        assert_ne!(a.root(), b.root());

        // A tree filled with its own default leaf has the empty root
        let empty_root = a.root();
        a.insert(f(9)).unwrap();
        assert_eq!(a.root(), empty_root);
    }

    #[test]
    fn test_update_matches_fresh_insert() {
        let mut updated = IncrementalMerkleTree::new(4, f(0)).unwrap();
        for v in 1..=5 {
            updated.insert(f(v)).unwrap();
        }
        updated.update(2, f(42)).unwrap();

        let mut fresh = IncrementalMerkleTree::new(4, f(0)).unwrap();
        for v in [1, 2, 42, 4, 5] {
            fresh.insert(f(v)).unwrap();
        }
        assert_eq!(updated.root(), fresh.root());
        assert_eq!(updated.index_of(&f(42)), Some(2));
        assert_eq!(updated.index_of(&f(3)), None);
    }

    #[test]
    fn test_update_out_of_range() {
        let mut tree = IncrementalMerkleTree::new(4, f(0)).unwrap();
        tree.insert(f(1)).unwrap();
        assert_eq!(
            tree.update(1, f(2)),
            Err(ImtError::IndexOutOfRange { index: 1, len: 1 })
        );
    }

    #[test]
    fn test_tree_full() {
        let mut tree = IncrementalMerkleTree::new(1, f(0)).unwrap();
        tree.insert(f(1)).unwrap();
        tree.insert(f(2)).unwrap();
        assert_eq!(tree.insert(f(3)), Err(ImtError::TreeFull(2)));
    }

    #[test]
    fn test_invalid_depth() {
        assert!(matches!(
            IncrementalMerkleTree::new(0, f(0)),
            Err(ImtError::InvalidDepth(0))
        ));
        assert!(matches!(
            IncrementalMerkleTree::new(33, f(0)),
            Err(ImtError::InvalidDepth(33))
        ));
        assert!(IncrementalMerkleTree::new(32, f(0)).is_ok());
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        let mut tree = IncrementalMerkleTree::new(5, f(0)).unwrap();
        for v in 0..11 {
            tree.insert(f(v * 3 + 1)).unwrap();
        }
        for i in 0..tree.len() {
            let proof = tree.create_proof(i).unwrap();
            assert_eq!(proof.siblings.len(), 5);
            assert!(proof.verify(tree.hasher()), "proof {} failed", i);
        }
    }
}
