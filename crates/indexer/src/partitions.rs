//! Attester (partition) tracking.

use anyhow::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use unisync_core::{AttesterId, AttesterSetting};

use crate::config::AttesterSelection;
use crate::error::SyncError;
use crate::listener::{
    decode_as, EventFilter, EventKind, EventLoader, EventSource, RunToken, UnirepEvent,
};
use crate::ordering::sort_canonical;
use crate::storage::Storage;

#[derive(Debug, Default)]
struct PartitionState {
    /// First entry is the default attester
    tracked: Vec<AttesterId>,
    settings: HashMap<AttesterId, AttesterSetting>,
}

/// Tracked attesters, the default attester and their epoch clocks.
#[derive(Debug)]
pub struct PartitionManager {
    track_all: bool,
    state: RwLock<PartitionState>,
}

/// Point-in-time view used while applying one event.
#[derive(Debug, Clone)]
pub struct PartitionSnapshot {
    /// Whether new registrations are tracked automatically
    pub track_all: bool,
    tracked: HashSet<AttesterId>,
    cursor_keys: Vec<AttesterId>,
}

impl PartitionSnapshot {
    /// Whether `id` is tracked.
    pub fn is_tracked(&self, id: &AttesterId) -> bool {
        self.tracked.contains(id)
    }

    /// Cursor rows advanced together with each applied event.
    pub fn cursor_keys(&self) -> &[AttesterId] {
        &self.cursor_keys
    }
}

impl PartitionManager {
    /// Create a manager for `selection`.
    pub fn new(selection: &AttesterSelection) -> Self {
        let tracked = match selection {
            AttesterSelection::All => Vec::new(),
            AttesterSelection::Only(ids) => {
                let mut seen = HashSet::new();
                ids.iter().copied().filter(|id| seen.insert(*id)).collect()
            }
        };
        Self {
            track_all: selection.is_all(),
            state: RwLock::new(PartitionState {
                tracked,
                settings: HashMap::new(),
            }),
        }
    }

    /// Whether every registered attester is tracked.
    pub fn is_track_all(&self) -> bool {
        self.track_all
    }

    /// Tracked attesters; the first is the default.
    pub fn tracked(&self) -> Vec<AttesterId> {
        self.state.read().tracked.clone()
    }

    /// Whether `id` is tracked.
    pub fn is_tracked(&self, id: &AttesterId) -> bool {
        self.state.read().tracked.contains(id)
    }

    /// Cursor rows that define synchronization progress.
    ///
    /// In track-all mode the genesis registration's row is included so
    /// progress is recorded before any attester exists.
    pub fn cursor_keys(&self) -> Vec<AttesterId> {
        let state = self.state.read();
        let mut keys = state.tracked.clone();
        if self.track_all {
            keys.push(AttesterId::GENESIS);
        }
        keys
    }

    /// Snapshot for one apply step.
    pub fn snapshot(&self) -> PartitionSnapshot {
        PartitionSnapshot {
            track_all: self.track_all,
            tracked: self.state.read().tracked.iter().copied().collect(),
            cursor_keys: self.cursor_keys(),
        }
    }

    /// Default attester.
    pub fn default_attester(&self) -> Result<AttesterId> {
        self.state
            .read()
            .tracked
            .first()
            .copied()
            .ok_or_else(|| SyncError::NoAttesterSynchronized.into())
    }

    /// Fail unless `id` is tracked.
    pub fn check(&self, id: AttesterId) -> Result<()> {
        let state = self.state.read();
        if state.tracked.is_empty() {
            return Err(SyncError::NoAttesterSynchronized.into());
        }
        if !state.tracked.contains(&id) {
            return Err(SyncError::AttesterNotSynchronized(id).into());
        }
        Ok(())
    }

    /// Make a tracked attester the default.
    pub fn set_default(&self, id: AttesterId) -> Result<()> {
        let mut state = self.state.write();
        let index = state
            .tracked
            .iter()
            .position(|t| *t == id)
            .ok_or(SyncError::AttesterNotSynchronized(id))?;
        state.tracked.swap(0, index);
        Ok(())
    }

    /// Record an attester's epoch clock and, in track-all mode, start
    /// tracking it.
    ///
    /// Returns `true` if the attester became tracked.
    pub fn register(&self, id: AttesterId, setting: AttesterSetting) -> bool {
        let mut state = self.state.write();
        state.settings.insert(id, setting);
        if self.track_all && !id.is_genesis() && !state.tracked.contains(&id) {
            state.tracked.push(id);
            return true;
        }
        false
    }

    /// Epoch clock of an attester.
    pub fn setting(&self, id: &AttesterId) -> Option<AttesterSetting> {
        self.state.read().settings.get(id).copied()
    }

    /// Estimated current epoch of a tracked attester at `now`.
    pub fn calc_current_epoch(&self, id: AttesterId, now: u64) -> Result<u64> {
        Ok(self.tracked_setting(id)?.epoch_at(now))
    }

    /// Seconds left in the estimated current epoch at `now`.
    pub fn calc_epoch_remaining_time(&self, id: AttesterId, now: u64) -> Result<u64> {
        Ok(self.tracked_setting(id)?.remaining_time(now))
    }

    fn tracked_setting(&self, id: AttesterId) -> Result<AttesterSetting> {
        self.check(id)?;
        self.setting(&id)
            .ok_or_else(|| SyncError::AttesterNotSynchronized(id).into())
    }

    /// One-time genesis scan.
    ///
    /// Finds the registration events of the tracked attesters (or every
    /// registration in track-all mode) between `start_block` and the head,
    /// records their epoch clocks and seeds a cursor just before each
    /// registration block.
    pub async fn discover(
        &self,
        source: Arc<dyn EventSource>,
        storage: &Storage,
        start_block: u64,
        loader_template: &EventLoader,
        token: &RunToken,
    ) -> Result<usize> {
        let topic1 = if self.track_all {
            Vec::new()
        } else {
            self.tracked().iter().map(AttesterId::to_topic).collect()
        };
        let filter = EventFilter {
            address: source.address(),
            topic0: vec![EventKind::AttesterSignedUp.topic()],
            topic1,
        };

        let head = source.block_number().await?;
        let mut events = loader_template
            .with_filter(filter)
            .load(start_block, head, token)
            .await?;
        sort_canonical(&mut events);

        if events.is_empty() {
            return Err(SyncError::GenesisNotFound.into());
        }

        let mut tx = storage.begin().await?;
        for raw in &events {
            let UnirepEvent::AttesterSignedUp {
                attester_id,
                epoch_length,
                timestamp,
            } = decode_as(EventKind::AttesterSignedUp, raw)?
            else {
                continue;
            };

            let setting = AttesterSetting {
                start_timestamp: timestamp,
                epoch_length,
            };
            if self.register(attester_id, setting) {
                info!("Tracking attester {}", attester_id);
            }
            Storage::seed_cursor(&mut tx, attester_id, raw.block_number.checked_sub(1)).await?;
        }
        tx.commit().await?;

        info!(
            "Found {} attester registrations up to block {}",
            events.len(),
            head
        );
        Ok(events.len())
    }
}
