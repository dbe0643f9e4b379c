//! Classified synchronizer errors.
//!
//! These travel inside `anyhow::Error`; callers that need to react to a
//! specific condition recover it with `err.downcast_ref::<SyncError>()`.

use alloy::primitives::B256;
use thiserror::Error;
use unisync_core::AttesterId;

/// Conditions the synchronizer distinguishes from plain I/O failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// An attestation named an epoch other than the attester's open epoch.
    #[error("Epoch ({epoch}) must be the same as the current synced epoch {current} for attester {attester_id}")]
    EpochMismatch {
        /// Attester the attestation belongs to
        attester_id: AttesterId,
        /// Epoch carried by the event
        epoch: u64,
        /// Latest persisted epoch of the attester
        current: u64,
    },

    /// A log carried a topic with no registered handler.
    #[error("Unrecognized event topic \"{0}\"")]
    UnrecognizedTopic(B256),

    /// No attester registration event exists for the tracked attesters.
    #[error("Failed to fetch genesis event")]
    GenesisNotFound,

    /// No attester is being synchronized.
    #[error("No attester is synchronized")]
    NoAttesterSynchronized,

    /// The requested attester is not tracked by this synchronizer.
    #[error("Attester {0} is not synchronized")]
    AttesterNotSynchronized(AttesterId),

    /// The run that issued the operation was stopped or superseded.
    #[error("Synchronizer run was cancelled")]
    Cancelled,

    /// An operation that needs setup was called before it.
    #[error("Synchronizer is not set up")]
    NotSetUp,

    /// Two event kinds share a topic.
    #[error("Duplicate event topic {0}")]
    DuplicateEventTopic(B256),

    /// A decoded value does not fit the range the store expects.
    #[error("Value out of range for {0}")]
    ValueOutOfRange(&'static str),
}

impl SyncError {
    /// Whether retrying the same operation unchanged can never succeed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Cancelled)
    }
}

/// Classify an `anyhow` error, if it carries a [`SyncError`].
pub fn classify(err: &anyhow::Error) -> Option<&SyncError> {
    err.chain().find_map(|cause| cause.downcast_ref::<SyncError>())
}
