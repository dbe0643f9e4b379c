//! Unirep event schema and decoding.

use alloy::primitives::{
    aliases::{U160, U48},
    Address, B256, U256,
};
use alloy::sol;
use alloy::sol_types::SolEvent;
use anyhow::{Context, Result};
use std::collections::HashMap;
use unisync_core::{AttesterId, Field};

use super::source::{EventFilter, RawEvent};
use crate::error::SyncError;

sol! {
    /// Unirep contract: events consumed by the synchronizer and the
    /// read-only calls used for authoritative lookups.
    #[sol(rpc)]
    #[derive(Debug, PartialEq, Eq)]
    contract Unirep {
        event AttesterSignedUp(uint160 indexed attesterId, uint48 epochLength, uint48 timestamp);
        event UserSignedUp(uint48 indexed epoch, uint256 indexed identityCommitment, uint160 indexed attesterId, uint256 leafIndex);
        event UserStateTransitioned(uint48 indexed epoch, uint160 indexed attesterId, uint256 indexed leafIndex, uint256 hashedLeaf, uint256 nullifier);
        event Attestation(uint48 indexed epoch, uint256 indexed epochKey, uint160 indexed attesterId, uint256 fieldIndex, uint256 change);
        event StateTreeLeaf(uint48 indexed epoch, uint160 indexed attesterId, uint256 indexed index, uint256 leaf);
        event EpochTreeLeaf(uint48 indexed epoch, uint160 indexed attesterId, uint256 indexed index, uint256 leaf);
        event HistoryTreeLeaf(uint160 indexed attesterId, uint256 leaf);
        event EpochEnded(uint48 indexed epoch, uint160 indexed attesterId);

        function stateTreeDepth() external view returns (uint8);
        function epochTreeDepth() external view returns (uint8);
        function historyTreeDepth() external view returns (uint8);
        function numEpochKeyNoncePerEpoch() external view returns (uint8);
        function fieldCount() external view returns (uint8);
        function sumFieldCount() external view returns (uint8);
        function replNonceBits() external view returns (uint8);
        function replFieldBits() external view returns (uint8);

        function attesterCurrentEpoch(uint160 attesterId) external view returns (uint48);
        function attesterEpochRoot(uint160 attesterId, uint48 epoch) external view returns (uint256);
        function attesterStateTreeRootExists(uint160 attesterId, uint48 epoch, uint256 root) external view returns (bool);
        function usedNullifiers(uint256 nullifier) external view returns (bool);
    }
}

/// Widen a `uint160` attester id.
pub(crate) fn attester_from_u160(value: U160) -> AttesterId {
    AttesterId::new(U256::from_be_slice(&value.to_be_bytes::<20>()))
}

/// Narrow an attester id for contract calls.
pub(crate) fn attester_to_u160(id: AttesterId) -> U160 {
    U160::from_be_slice(&id.low_bytes())
}

/// Widen a `uint48` epoch or timestamp.
pub(crate) fn from_u48(value: U48) -> u64 {
    value.to::<u64>()
}

/// Narrow an epoch for contract calls.
pub(crate) fn to_u48(value: u64, what: &'static str) -> Result<U48> {
    U48::try_from(value).map_err(|_| SyncError::ValueOutOfRange(what).into())
}

/// The event types the synchronizer handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `AttesterSignedUp`
    AttesterSignedUp,
    /// `UserSignedUp`
    UserSignedUp,
    /// `UserStateTransitioned`
    UserStateTransitioned,
    /// `Attestation`
    Attestation,
    /// `StateTreeLeaf`
    StateTreeLeaf,
    /// `EpochTreeLeaf`
    EpochTreeLeaf,
    /// `HistoryTreeLeaf`
    HistoryTreeLeaf,
    /// `EpochEnded`
    EpochEnded,
}

impl EventKind {
    /// Every handled event type.
    pub const ALL: [EventKind; 8] = [
        EventKind::UserSignedUp,
        EventKind::UserStateTransitioned,
        EventKind::Attestation,
        EventKind::EpochEnded,
        EventKind::StateTreeLeaf,
        EventKind::EpochTreeLeaf,
        EventKind::AttesterSignedUp,
        EventKind::HistoryTreeLeaf,
    ];

    /// Solidity event name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AttesterSignedUp => "AttesterSignedUp",
            EventKind::UserSignedUp => "UserSignedUp",
            EventKind::UserStateTransitioned => "UserStateTransitioned",
            EventKind::Attestation => "Attestation",
            EventKind::StateTreeLeaf => "StateTreeLeaf",
            EventKind::EpochTreeLeaf => "EpochTreeLeaf",
            EventKind::HistoryTreeLeaf => "HistoryTreeLeaf",
            EventKind::EpochEnded => "EpochEnded",
        }
    }

    /// Event signature hash (`topic0`).
    pub fn topic(&self) -> B256 {
        match self {
            EventKind::AttesterSignedUp => Unirep::AttesterSignedUp::SIGNATURE_HASH,
            EventKind::UserSignedUp => Unirep::UserSignedUp::SIGNATURE_HASH,
            EventKind::UserStateTransitioned => Unirep::UserStateTransitioned::SIGNATURE_HASH,
            EventKind::Attestation => Unirep::Attestation::SIGNATURE_HASH,
            EventKind::StateTreeLeaf => Unirep::StateTreeLeaf::SIGNATURE_HASH,
            EventKind::EpochTreeLeaf => Unirep::EpochTreeLeaf::SIGNATURE_HASH,
            EventKind::HistoryTreeLeaf => Unirep::HistoryTreeLeaf::SIGNATURE_HASH,
            EventKind::EpochEnded => Unirep::EpochEnded::SIGNATURE_HASH,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded Unirep event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnirepEvent {
    /// An attester registered its epoch clock.
    AttesterSignedUp {
        /// Registering attester
        attester_id: AttesterId,
        /// Epoch length in seconds
        epoch_length: u64,
        /// Start of epoch 0
        timestamp: u64,
    },
    /// A user joined an attester.
    UserSignedUp {
        /// Epoch of the sign up
        epoch: u64,
        /// Identity commitment
        identity_commitment: Field,
        /// Attester
        attester_id: AttesterId,
        /// State tree index of the user's leaf
        leaf_index: Field,
    },
    /// A user moved to a new epoch, consuming a nullifier.
    UserStateTransitioned {
        /// Epoch transitioned into
        epoch: u64,
        /// Attester
        attester_id: AttesterId,
        /// State tree index of the new leaf
        leaf_index: Field,
        /// Hash of the new leaf
        hashed_leaf: Field,
        /// Consumed nullifier
        nullifier: Field,
    },
    /// A data change attested to an epoch key.
    Attestation {
        /// Epoch the attestation targets
        epoch: u64,
        /// Receiving epoch key
        epoch_key: Field,
        /// Attester
        attester_id: AttesterId,
        /// Data field index
        field_index: u64,
        /// Change applied to the field
        change: Field,
    },
    /// A state tree leaf was inserted.
    StateTreeLeaf {
        /// Epoch of the tree
        epoch: u64,
        /// Attester
        attester_id: AttesterId,
        /// Leaf index
        index: u64,
        /// Leaf value
        leaf: Field,
    },
    /// An epoch tree leaf was written.
    EpochTreeLeaf {
        /// Epoch of the tree
        epoch: u64,
        /// Attester
        attester_id: AttesterId,
        /// Leaf index
        index: u64,
        /// Leaf value
        leaf: Field,
    },
    /// A history tree leaf was appended.
    HistoryTreeLeaf {
        /// Attester
        attester_id: AttesterId,
        /// Leaf value
        leaf: Field,
    },
    /// An epoch was sealed.
    EpochEnded {
        /// Sealed epoch
        epoch: u64,
        /// Attester
        attester_id: AttesterId,
    },
}

impl UnirepEvent {
    /// Event type.
    pub fn kind(&self) -> EventKind {
        match self {
            UnirepEvent::AttesterSignedUp { .. } => EventKind::AttesterSignedUp,
            UnirepEvent::UserSignedUp { .. } => EventKind::UserSignedUp,
            UnirepEvent::UserStateTransitioned { .. } => EventKind::UserStateTransitioned,
            UnirepEvent::Attestation { .. } => EventKind::Attestation,
            UnirepEvent::StateTreeLeaf { .. } => EventKind::StateTreeLeaf,
            UnirepEvent::EpochTreeLeaf { .. } => EventKind::EpochTreeLeaf,
            UnirepEvent::HistoryTreeLeaf { .. } => EventKind::HistoryTreeLeaf,
            UnirepEvent::EpochEnded { .. } => EventKind::EpochEnded,
        }
    }

    /// Attester the event belongs to.
    pub fn attester_id(&self) -> AttesterId {
        match self {
            UnirepEvent::AttesterSignedUp { attester_id, .. }
            | UnirepEvent::UserSignedUp { attester_id, .. }
            | UnirepEvent::UserStateTransitioned { attester_id, .. }
            | UnirepEvent::Attestation { attester_id, .. }
            | UnirepEvent::StateTreeLeaf { attester_id, .. }
            | UnirepEvent::EpochTreeLeaf { attester_id, .. }
            | UnirepEvent::HistoryTreeLeaf { attester_id, .. }
            | UnirepEvent::EpochEnded { attester_id, .. } => *attester_id,
        }
    }
}

fn narrow(value: U256, what: &'static str) -> Result<u64> {
    u64::try_from(value).map_err(|_| SyncError::ValueOutOfRange(what).into())
}

/// Topic to event-type dispatch table.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    kinds: HashMap<B256, EventKind>,
}

impl EventDecoder {
    /// Build the table for every [`EventKind`].
    ///
    /// Fails if two kinds share a topic.
    pub fn new() -> Result<Self> {
        let mut kinds = HashMap::with_capacity(EventKind::ALL.len());
        for kind in EventKind::ALL {
            if kinds.insert(kind.topic(), kind).is_some() {
                return Err(SyncError::DuplicateEventTopic(kind.topic()).into());
            }
        }
        Ok(Self { kinds })
    }

    /// Event type registered for `topic`.
    pub fn kind_of(&self, topic: &B256) -> Option<EventKind> {
        self.kinds.get(topic).copied()
    }

    /// Filter matching every handled event emitted by `address`.
    pub fn filter(&self, address: Address) -> EventFilter {
        let mut topics: Vec<B256> = self.kinds.keys().copied().collect();
        topics.sort();
        EventFilter {
            address,
            topic0: topics,
            topic1: Vec::new(),
        }
    }

    /// Decode a raw log.
    pub fn decode(&self, raw: &RawEvent) -> Result<UnirepEvent> {
        let topic = raw.topics.first().copied().unwrap_or_default();
        let kind = self
            .kind_of(&topic)
            .ok_or(SyncError::UnrecognizedTopic(topic))?;
        decode_as(kind, raw)
            .with_context(|| format!("Failed to decode {} event at {}", kind, raw.position()))
    }
}

/// Decode a raw log as a specific event type.
pub fn decode_as(kind: EventKind, raw: &RawEvent) -> Result<UnirepEvent> {
    let topics = raw.topics.iter().copied();
    let data = raw.data.as_ref();

    let event = match kind {
        EventKind::AttesterSignedUp => {
            let e = Unirep::AttesterSignedUp::decode_raw_log(topics, data, true)?;
            UnirepEvent::AttesterSignedUp {
                attester_id: attester_from_u160(e.attesterId),
                epoch_length: from_u48(e.epochLength),
                timestamp: from_u48(e.timestamp),
            }
        }
        EventKind::UserSignedUp => {
            let e = Unirep::UserSignedUp::decode_raw_log(topics, data, true)?;
            UnirepEvent::UserSignedUp {
                epoch: from_u48(e.epoch),
                identity_commitment: e.identityCommitment,
                attester_id: attester_from_u160(e.attesterId),
                leaf_index: e.leafIndex,
            }
        }
        EventKind::UserStateTransitioned => {
            let e = Unirep::UserStateTransitioned::decode_raw_log(topics, data, true)?;
            UnirepEvent::UserStateTransitioned {
                epoch: from_u48(e.epoch),
                attester_id: attester_from_u160(e.attesterId),
                leaf_index: e.leafIndex,
                hashed_leaf: e.hashedLeaf,
                nullifier: e.nullifier,
            }
        }
        EventKind::Attestation => {
            let e = Unirep::Attestation::decode_raw_log(topics, data, true)?;
            UnirepEvent::Attestation {
                epoch: from_u48(e.epoch),
                epoch_key: e.epochKey,
                attester_id: attester_from_u160(e.attesterId),
                field_index: narrow(e.fieldIndex, "Attestation.fieldIndex")?,
                change: e.change,
            }
        }
        EventKind::StateTreeLeaf => {
            let e = Unirep::StateTreeLeaf::decode_raw_log(topics, data, true)?;
            UnirepEvent::StateTreeLeaf {
                epoch: from_u48(e.epoch),
                attester_id: attester_from_u160(e.attesterId),
                index: narrow(e.index, "StateTreeLeaf.index")?,
                leaf: e.leaf,
            }
        }
        EventKind::EpochTreeLeaf => {
            let e = Unirep::EpochTreeLeaf::decode_raw_log(topics, data, true)?;
            UnirepEvent::EpochTreeLeaf {
                epoch: from_u48(e.epoch),
                attester_id: attester_from_u160(e.attesterId),
                index: narrow(e.index, "EpochTreeLeaf.index")?,
                leaf: e.leaf,
            }
        }
        EventKind::HistoryTreeLeaf => {
            let e = Unirep::HistoryTreeLeaf::decode_raw_log(topics, data, true)?;
            UnirepEvent::HistoryTreeLeaf {
                attester_id: attester_from_u160(e.attesterId),
                leaf: e.leaf,
            }
        }
        EventKind::EpochEnded => {
            let e = Unirep::EpochEnded::decode_raw_log(topics, data, true)?;
            UnirepEvent::EpochEnded {
                epoch: from_u48(e.epoch),
                attester_id: attester_from_u160(e.attesterId),
            }
        }
    };

    Ok(event)
}
