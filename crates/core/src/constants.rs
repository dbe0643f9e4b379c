//! Protocol constants.

use crate::types::Field;

/// Largest representable epoch (`uint48` max).
///
/// Attestations carrying this epoch are accepted regardless of the
/// attester's currently open epoch.
pub const MAX_EPOCH: u64 = (1 << 48) - 1;

/// Default (empty) leaf of a state tree.
pub const DEFAULT_STATE_TREE_LEAF: Field = Field::ZERO;

/// Default (empty) leaf of an epoch tree.
pub const DEFAULT_EPOCH_TREE_LEAF: Field = Field::ZERO;

/// Default (empty) leaf of a history tree.
pub const DEFAULT_HISTORY_TREE_LEAF: Field = Field::ZERO;

/// Width of the zero-padded block number in an attestation index key.
pub const ATTESTATION_BLOCK_DIGITS: usize = 15;

/// Width of the zero-padded transaction and log index in an attestation index key.
pub const ATTESTATION_INDEX_DIGITS: usize = 8;
