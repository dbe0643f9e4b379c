//! Per-event state transitions.
//!
//! Every handler runs inside the transaction that also advances the
//! cursors, and every read goes through that transaction's connection.

use anyhow::Result;
use sqlx::SqliteConnection;
use tracing::{debug, info};
use unisync_core::{AttesterId, AttesterSetting, MAX_EPOCH};

use crate::error::SyncError;
use crate::listener::{RawEvent, UnirepEvent};
use crate::partitions::PartitionSnapshot;
use crate::storage::{
    AttestationRecord, AttesterRecord, NullifierRecord, Storage, TreeLeafRecord, UserSignUpRecord,
};

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The event changed the store.
    Applied,
    /// The store already held the event's effects.
    Redundant,
    /// The event belongs to an untracked attester.
    Ignored,
}

impl HandlerOutcome {
    /// Whether observers should hear about the event.
    pub fn is_notified(&self) -> bool {
        !matches!(self, HandlerOutcome::Ignored)
    }

    fn from_changed(changed: bool) -> Self {
        if changed {
            HandlerOutcome::Applied
        } else {
            HandlerOutcome::Redundant
        }
    }
}

/// An attester that starts being tracked once the current event commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagedRegistration {
    /// New attester
    pub attester_id: AttesterId,
    /// Its epoch clock
    pub setting: AttesterSetting,
}

/// Inputs of one apply step.
pub struct ApplyContext<'a> {
    /// Transaction connection
    pub conn: &'a mut SqliteConnection,
    /// Source log
    pub raw: &'a RawEvent,
    /// Tracked attesters at the start of the step
    pub partitions: &'a PartitionSnapshot,
    /// Registrations produced by this step
    pub staged: Vec<StagedRegistration>,
}

impl<'a> ApplyContext<'a> {
    /// New context with nothing staged.
    pub fn new(
        conn: &'a mut SqliteConnection,
        raw: &'a RawEvent,
        partitions: &'a PartitionSnapshot,
    ) -> Self {
        Self {
            conn,
            raw,
            partitions,
            staged: Vec::new(),
        }
    }

    fn is_tracked(&self, id: &AttesterId) -> bool {
        self.partitions.is_tracked(id) || self.staged.iter().any(|s| s.attester_id == *id)
    }
}

/// Apply one decoded event.
pub async fn apply(ctx: &mut ApplyContext<'_>, event: &UnirepEvent) -> Result<HandlerOutcome> {
    if let UnirepEvent::AttesterSignedUp {
        attester_id,
        epoch_length,
        timestamp,
    } = event
    {
        return attester_signed_up(ctx, *attester_id, *epoch_length, *timestamp).await;
    }

    let attester_id = event.attester_id();
    if !ctx.is_tracked(&attester_id) {
        debug!(
            "Skipping {} for untracked attester {}",
            event.kind(),
            attester_id
        );
        return Ok(HandlerOutcome::Ignored);
    }

    let block_number = ctx.raw.block_number;
    let conn = &mut *ctx.conn;

    let outcome = match event {
        UnirepEvent::AttesterSignedUp { .. } => HandlerOutcome::Ignored,

        UnirepEvent::UserSignedUp {
            epoch,
            identity_commitment,
            attester_id,
            ..
        } => {
            let record = UserSignUpRecord {
                commitment: *identity_commitment,
                attester_id: *attester_id,
                epoch: *epoch,
                block_number,
            };
            HandlerOutcome::from_changed(Storage::insert_user_signup(conn, &record).await?)
        }

        UnirepEvent::UserStateTransitioned {
            epoch,
            attester_id,
            nullifier,
            ..
        } => {
            let record = NullifierRecord {
                nullifier: *nullifier,
                attester_id: *attester_id,
                epoch: *epoch,
                transaction_hash: Some(ctx.raw.transaction_hash),
                block_number,
            };
            HandlerOutcome::from_changed(Storage::insert_nullifier(conn, &record).await?)
        }

        UnirepEvent::Attestation {
            epoch,
            epoch_key,
            attester_id,
            field_index,
            change,
        } => {
            let index = ctx.raw.position().index_key();
            if Storage::attestation_exists(conn, &index).await? {
                return Ok(HandlerOutcome::Redundant);
            }

            if *epoch != MAX_EPOCH {
                let current = Storage::latest_epoch(conn, *attester_id)
                    .await?
                    .map_or(0, |e| e.number);
                if *epoch != current {
                    return Err(SyncError::EpochMismatch {
                        attester_id: *attester_id,
                        epoch: *epoch,
                        current,
                    }
                    .into());
                }
            }

            let record = AttestationRecord {
                index,
                attester_id: *attester_id,
                epoch: *epoch,
                epoch_key: *epoch_key,
                field_index: *field_index,
                change: *change,
                block_number,
            };
            Storage::insert_attestation(conn, &record).await?;
            if *epoch != MAX_EPOCH {
                Storage::ensure_epoch(conn, *attester_id, *epoch).await?;
            }
            HandlerOutcome::Applied
        }

        UnirepEvent::StateTreeLeaf {
            epoch,
            attester_id,
            index,
            leaf,
        } => {
            let record = TreeLeafRecord {
                attester_id: *attester_id,
                epoch: *epoch,
                index: *index,
                hash: *leaf,
                block_number,
            };
            HandlerOutcome::from_changed(Storage::insert_state_tree_leaf(conn, &record).await?)
        }

        UnirepEvent::EpochTreeLeaf {
            epoch,
            attester_id,
            index,
            leaf,
        } => {
            let record = TreeLeafRecord {
                attester_id: *attester_id,
                epoch: *epoch,
                index: *index,
                hash: *leaf,
                block_number,
            };
            HandlerOutcome::from_changed(Storage::upsert_epoch_tree_leaf(conn, &record).await?)
        }

        UnirepEvent::HistoryTreeLeaf { attester_id, leaf } => {
            let index = Storage::append_history_tree_leaf(conn, *attester_id, *leaf).await?;
            debug!("History leaf {} of attester {}", index, attester_id);
            HandlerOutcome::Applied
        }

        UnirepEvent::EpochEnded { epoch, attester_id } => {
            let sealed = Storage::seal_epoch(conn, *attester_id, *epoch).await?;
            let next = epoch.saturating_add(1);
            let opened = Storage::ensure_epoch(conn, *attester_id, next).await?;
            if sealed {
                info!("Epoch {} ended for attester {}", epoch, attester_id);
            }
            HandlerOutcome::from_changed(sealed || opened)
        }
    };

    Ok(outcome)
}

async fn attester_signed_up(
    ctx: &mut ApplyContext<'_>,
    attester_id: AttesterId,
    epoch_length: u64,
    timestamp: u64,
) -> Result<HandlerOutcome> {
    if ctx.partitions.track_all && !attester_id.is_genesis() && !ctx.is_tracked(&attester_id) {
        Storage::seed_cursor(ctx.conn, attester_id, ctx.raw.block_number.checked_sub(1)).await?;
        ctx.staged.push(StagedRegistration {
            attester_id,
            setting: AttesterSetting {
                start_timestamp: timestamp,
                epoch_length,
            },
        });
    }

    if !ctx.is_tracked(&attester_id) {
        return Ok(HandlerOutcome::Ignored);
    }

    let record = AttesterRecord {
        attester_id,
        start_timestamp: timestamp,
        epoch_length,
    };
    Ok(HandlerOutcome::from_changed(
        Storage::upsert_attester(ctx.conn, &record).await?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttesterSelection;
    use crate::partitions::PartitionManager;
    use alloy::primitives::{Address, Bytes, B256, U256};

    fn raw(block: u64, tx: u64, log: u64) -> RawEvent {
        RawEvent {
            address: Address::repeat_byte(1),
            block_number: block,
            transaction_index: tx,
            log_index: log,
            topics: Vec::new(),
            data: Bytes::new(),
            transaction_hash: B256::repeat_byte(0xab),
        }
    }

    fn tracked(ids: &[u64]) -> PartitionSnapshot {
        PartitionManager::new(&AttesterSelection::Only(
            ids.iter().map(|i| AttesterId::from(*i)).collect(),
        ))
        .snapshot()
    }

    fn attestation(epoch: u64) -> UnirepEvent {
        UnirepEvent::Attestation {
            epoch,
            epoch_key: U256::from(77),
            attester_id: AttesterId::from(1u64),
            field_index: 0,
            change: U256::from(5),
        }
    }

    #[tokio::test]
    async fn test_untracked_attester_is_ignored() {
        let storage = Storage::in_memory().await.unwrap();
        let snapshot = tracked(&[1]);
        let mut tx = storage.begin().await.unwrap();
        let event = UnirepEvent::EpochEnded {
            epoch: 0,
            attester_id: AttesterId::from(2u64),
        };
        let r = raw(10, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(apply(&mut ctx, &event).await.unwrap(), HandlerOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_attestation_epoch_validation() {
        let storage = Storage::in_memory().await.unwrap();
        let snapshot = tracked(&[1]);
        let mut tx = storage.begin().await.unwrap();

        let r = raw(10, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(
            apply(&mut ctx, &attestation(0)).await.unwrap(),
            HandlerOutcome::Applied
        );

        // Replay of the same log
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(
            apply(&mut ctx, &attestation(0)).await.unwrap(),
            HandlerOutcome::Redundant
        );

        let r = raw(11, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        let err = apply(&mut ctx, &attestation(3)).await.unwrap_err();
        assert_eq!(
            crate::error::classify(&err),
            Some(&SyncError::EpochMismatch {
                attester_id: AttesterId::from(1u64),
                epoch: 3,
                current: 0,
            })
        );

        // The sentinel epoch is always accepted
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(
            apply(&mut ctx, &attestation(MAX_EPOCH)).await.unwrap(),
            HandlerOutcome::Applied
        );
        assert!(Storage::get_epoch(&mut tx, AttesterId::from(1u64), MAX_EPOCH)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_epoch_ended_opens_next_epoch() {
        let storage = Storage::in_memory().await.unwrap();
        let snapshot = tracked(&[1]);
        let mut tx = storage.begin().await.unwrap();
        let event = UnirepEvent::EpochEnded {
            epoch: 0,
            attester_id: AttesterId::from(1u64),
        };

        let r = raw(20, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(apply(&mut ctx, &event).await.unwrap(), HandlerOutcome::Applied);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(apply(&mut ctx, &event).await.unwrap(), HandlerOutcome::Redundant);

        let latest = Storage::latest_epoch(&mut tx, AttesterId::from(1u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.number, 1);
        assert!(!latest.sealed);

        // Attestations now target epoch 1
        let r = raw(21, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert!(apply(&mut ctx, &attestation(0)).await.is_err());
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(
            apply(&mut ctx, &attestation(1)).await.unwrap(),
            HandlerOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_track_all_stages_new_attester() {
        let storage = Storage::in_memory().await.unwrap();
        let snapshot = PartitionManager::new(&AttesterSelection::All).snapshot();
        let mut tx = storage.begin().await.unwrap();
        let event = UnirepEvent::AttesterSignedUp {
            attester_id: AttesterId::from(9u64),
            epoch_length: 300,
            timestamp: 1_000,
        };

        let r = raw(50, 1, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(apply(&mut ctx, &event).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(ctx.staged.len(), 1);
        assert_eq!(ctx.staged[0].setting.epoch_length, 300);

        let cursor = Storage::get_cursor(&mut tx, AttesterId::from(9u64))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cursor.latest_complete_block, Some(49));

        // The genesis registration is never tracked
        let genesis = UnirepEvent::AttesterSignedUp {
            attester_id: AttesterId::GENESIS,
            epoch_length: 1,
            timestamp: 0,
        };
        let r = raw(1, 0, 0);
        let mut ctx = ApplyContext::new(&mut tx, &r, &snapshot);
        assert_eq!(apply(&mut ctx, &genesis).await.unwrap(), HandlerOutcome::Ignored);
        assert!(ctx.staged.is_empty());
    }
}
