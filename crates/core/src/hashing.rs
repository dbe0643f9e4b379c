//! Hashing utilities.
//!
//! Provides keccak256 hashing and the pair hash used for tree nodes.

use alloy_primitives::{keccak256 as alloy_keccak256, B256};

use crate::types::Field;

/// Compute keccak256 hash of input data.
///
/// This is a re-export of Alloy's keccak256 for convenience.
pub fn keccak256(data: &[u8]) -> B256 {
    alloy_keccak256(data)
}

/// Hash two field elements into their parent node.
///
/// Computed as `keccak256(left || right)` over the 32-byte big-endian
/// encodings, interpreted back as a big-endian integer.
pub fn hash_pair(left: &Field, right: &Field) -> Field {
    let mut data = [0u8; 64];
    data[..32].copy_from_slice(&left.to_be_bytes::<32>());
    data[32..].copy_from_slice(&right.to_be_bytes::<32>());
    Field::from_be_bytes(keccak256(&data).0)
}
