//! Database types for the synchronizer storage layer.

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use unisync_core::{AttesterId, AttesterSetting, EventPosition, Field};

/// Per-attester synchronization cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    /// Attester the cursor belongs to
    pub attester_id: AttesterId,

    /// Highest block whose events are fully applied (`None`: not even block 0)
    pub latest_complete_block: Option<u64>,

    /// Position of the last applied event
    pub latest_processed: Option<EventPosition>,

    /// Last update (unix seconds)
    pub updated_at: i64,
}

impl SyncCursor {
    /// First block not yet known to be complete.
    pub fn next_block(&self) -> u64 {
        self.latest_complete_block.map_or(0, |b| b.saturating_add(1))
    }

    /// Whether blocks up to `block` are complete.
    pub fn is_complete_to(&self, block: u64) -> bool {
        self.latest_complete_block.is_some_and(|b| b >= block)
    }

    /// Whether the event at `position` was already applied.
    pub fn has_processed(&self, position: EventPosition) -> bool {
        self.latest_processed.is_some_and(|p| p >= position)
    }
}

/// A registered attester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttesterRecord {
    /// Attester id
    pub attester_id: AttesterId,

    /// Start of epoch 0 (unix seconds)
    pub start_timestamp: u64,

    /// Epoch length in seconds
    pub epoch_length: u64,
}

impl AttesterRecord {
    /// Epoch clock of this attester.
    pub fn setting(&self) -> AttesterSetting {
        AttesterSetting {
            start_timestamp: self.start_timestamp,
            epoch_length: self.epoch_length,
        }
    }
}

/// Epoch lifecycle row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Attester id
    pub attester_id: AttesterId,

    /// Epoch number
    pub number: u64,

    /// Whether an `EpochEnded` event was observed
    pub sealed: bool,
}

/// State or epoch tree leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLeafRecord {
    /// Attester id
    pub attester_id: AttesterId,

    /// Epoch of the tree
    pub epoch: u64,

    /// Leaf index
    pub index: u64,

    /// Leaf value
    pub hash: Field,

    /// Block of the emitting event
    pub block_number: u64,
}

/// A user sign up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSignUpRecord {
    /// Identity commitment
    pub commitment: Field,

    /// Attester id
    pub attester_id: AttesterId,

    /// Epoch of the sign up
    pub epoch: u64,

    /// Block of the emitting event
    pub block_number: u64,
}

/// An attestation, keyed by the position of its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    /// Zero-padded `(block, tx, log)` key
    pub index: String,

    /// Attester id
    pub attester_id: AttesterId,

    /// Target epoch
    pub epoch: u64,

    /// Receiving epoch key
    pub epoch_key: Field,

    /// Data field index
    pub field_index: u64,

    /// Change applied to the field
    pub change: Field,

    /// Block of the emitting event
    pub block_number: u64,
}

/// A consumed nullifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullifierRecord {
    /// Nullifier value
    pub nullifier: Field,

    /// Attester id
    pub attester_id: AttesterId,

    /// Epoch of the transition
    pub epoch: u64,

    /// Transaction that consumed it, when known
    pub transaction_hash: Option<B256>,

    /// Block of the emitting event
    pub block_number: u64,
}

/// History tree leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTreeLeafRecord {
    /// Attester id
    pub attester_id: AttesterId,

    /// Leaf index (per-attester running counter)
    pub index: u64,

    /// Leaf value
    pub leaf: Field,
}
