//! Error types for the IMT crate.

use thiserror::Error;

/// IMT error type.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ImtError {
    /// Depth outside of the supported range.
    #[error("Invalid tree depth {0}: must be between 1 and {max}", max = crate::tree::MAX_DEPTH)]
    InvalidDepth(u8),

    /// Every leaf slot is already occupied.
    #[error("Tree is full: capacity {0}")]
    TreeFull(u64),

    /// Leaf index is past the number of inserted leaves.
    #[error("Leaf index {index} out of range (tree has {len} leaves)")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of leaves in the tree
        len: usize,
    },
}

/// Result type alias for ImtError.
pub type Result<T> = std::result::Result<T, ImtError>;
