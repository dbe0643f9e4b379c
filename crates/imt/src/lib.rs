//! Incremental Merkle tree for rebuilding Unirep trees.
//!
//! This crate provides:
//! - A fixed-depth, append-only Merkle tree with in-place leaf updates
//! - Inclusion proofs and their verification
//! - A pluggable node hasher (keccak256 by default)
//!
//! State, epoch and history trees are all instances of the same
//! structure with different depths and default leaves.

#![warn(missing_docs)]

pub mod error;
pub mod hasher;
pub mod proof;
pub mod tree;

pub use error::{ImtError, Result};
pub use hasher::{Keccak256Hasher, TreeHasher};
pub use proof::MerkleProof;
pub use tree::{IncrementalMerkleTree, MAX_DEPTH};
