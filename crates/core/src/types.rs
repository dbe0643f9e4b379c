//! Core types for the synchronizer.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A SNARK field element as emitted by the contract (`uint256`).
pub type Field = U256;

/// Parse a field element from a decimal or `0x`-prefixed hex string.
pub fn parse_field(input: &str) -> Result<Field, CoreError> {
    Field::from_str(input.trim()).map_err(|_| CoreError::InvalidField(input.to_string()))
}

/// Big-endian 32-byte encoding of a field element (storage representation).
pub fn field_to_bytes(value: &Field) -> [u8; 32] {
    value.to_be_bytes::<32>()
}

/// Decode a field element from its big-endian storage representation.
pub fn field_from_bytes(bytes: &[u8]) -> Field {
    Field::from_be_slice(bytes)
}

/// Attester identifier (the attester's `uint160` address widened to 256 bits).
///
/// Each attester is an independent partition with its own epoch clock
/// and tree namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttesterId(pub U256);

impl AttesterId {
    /// The reserved id of the protocol's own genesis registration.
    pub const GENESIS: AttesterId = AttesterId(U256::ZERO);

    /// Create a new attester id.
    pub const fn new(value: U256) -> Self {
        AttesterId(value)
    }

    /// Get the inner value.
    pub const fn inner(&self) -> &U256 {
        &self.0
    }

    /// Whether this is the reserved genesis id.
    pub fn is_genesis(&self) -> bool {
        self.0.is_zero()
    }

    /// Encode as an indexed event topic.
    pub fn to_topic(&self) -> B256 {
        B256::from(self.0.to_be_bytes::<32>())
    }

    /// Big-endian storage representation.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_be_bytes::<32>()
    }

    /// Decode from the big-endian storage representation.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        AttesterId(U256::from_be_slice(bytes))
    }

    /// The low 160 bits, as expected by contract calls taking a `uint160`.
    pub fn low_bytes(&self) -> [u8; 20] {
        let bytes = self.to_bytes();
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes[12..]);
        out
    }
}

impl fmt::Display for AttesterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<U256> for AttesterId {
    fn from(value: U256) -> Self {
        AttesterId(value)
    }
}

impl From<Address> for AttesterId {
    fn from(address: Address) -> Self {
        AttesterId(U256::from_be_slice(address.as_slice()))
    }
}

impl From<u64> for AttesterId {
    fn from(value: u64) -> Self {
        AttesterId(U256::from(value))
    }
}

impl FromStr for AttesterId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str(s.trim())
            .map(AttesterId)
            .map_err(|_| CoreError::InvalidAttesterId(s.to_string()))
    }
}

// Serialized as a decimal string, the representation used by event indexers.
impl Serialize for AttesterId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for AttesterId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        AttesterId::from_str(&value).map_err(|e| serde::de::Error::custom(format!("{}", e)))
    }
}

/// Canonical position of an event in the chain.
///
/// Events are totally ordered by `(block_number, tx_index, log_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    /// Block number
    pub block_number: u64,

    /// Transaction index within block
    pub tx_index: u64,

    /// Log index within the block
    pub log_index: u64,
}

impl EventPosition {
    /// Create a new event position.
    pub fn new(block_number: u64, tx_index: u64, log_index: u64) -> Self {
        Self {
            block_number,
            tx_index,
            log_index,
        }
    }

    /// Zero-padded string key that sorts lexicographically in event order.
    ///
    /// Attestations have no natural identifier of their own and are keyed
    /// by the position of the log that emitted them.
    pub fn index_key(&self) -> String {
        format!(
            "{:0bw$}{:0iw$}{:0iw$}",
            self.block_number,
            self.tx_index,
            self.log_index,
            bw = crate::constants::ATTESTATION_BLOCK_DIGITS,
            iw = crate::constants::ATTESTATION_INDEX_DIGITS,
        )
    }
}

impl fmt::Display for EventPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.block_number, self.tx_index, self.log_index)
    }
}

/// Registration parameters of an attester. Immutable once registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttesterSetting {
    /// Unix timestamp (seconds) at which epoch 0 started
    pub start_timestamp: u64,

    /// Epoch length in seconds
    pub epoch_length: u64,
}

impl AttesterSetting {
    /// Create a new attester setting.
    pub fn new(start_timestamp: u64, epoch_length: u64) -> Result<Self, CoreError> {
        if epoch_length == 0 {
            return Err(CoreError::ZeroEpochLength);
        }
        Ok(Self {
            start_timestamp,
            epoch_length,
        })
    }

    /// Estimated epoch at `now`: `floor((now - start) / length)`, clamped to zero.
    pub fn epoch_at(&self, now: u64) -> u64 {
        if self.epoch_length == 0 {
            return 0;
        }
        now.saturating_sub(self.start_timestamp) / self.epoch_length
    }

    /// Seconds left in the epoch containing `now`.
    pub fn remaining_time(&self, now: u64) -> u64 {
        let epoch = self.epoch_at(now);
        let epoch_end = self
            .start_timestamp
            .saturating_add(epoch.saturating_add(1).saturating_mul(self.epoch_length));
        epoch_end.saturating_sub(now)
    }
}

/// Protocol-wide parameters read from the contract once at setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Depth of every attester's state tree
    pub state_tree_depth: u8,
    /// Depth of every attester's epoch tree
    pub epoch_tree_depth: u8,
    /// Depth of every attester's history tree
    pub history_tree_depth: u8,
    /// Number of epoch key nonces per epoch
    pub num_epoch_key_nonce_per_epoch: u8,
    /// Number of data fields per user
    pub field_count: u8,
    /// Number of summed data fields
    pub sum_field_count: u8,
    /// Bits reserved for the replacement nonce
    pub repl_nonce_bits: u8,
    /// Bits reserved for a replacement field value
    pub repl_field_bits: u8,
}
