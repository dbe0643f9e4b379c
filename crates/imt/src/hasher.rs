//! Node hashing.

use unisync_core::{hash_pair, Field};

/// Hash function combining two child nodes into their parent.
///
/// Trees built by different hashers are incompatible; the hasher must
/// match the one used by the on-chain contract for roots to agree.
pub trait TreeHasher: Clone + Send + Sync {
    /// Combine `left` and `right` into a parent node.
    fn hash_pair(&self, left: &Field, right: &Field) -> Field;
}

/// `keccak256(left || right)` over 32-byte big-endian encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Keccak256Hasher;

impl TreeHasher for Keccak256Hasher {
    fn hash_pair(&self, left: &Field, right: &Field) -> Field {
        hash_pair(left, right)
    }
}
