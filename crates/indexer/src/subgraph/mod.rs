//! Paginated-query adapter.
//!
//! Ingests the same logical schemas the live handlers produce from a
//! subgraph, page by page, and writes them through the same storage
//! primitives so both adapters converge on the same store state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use unisync_core::{AttesterId, AttesterSetting, EventPosition, ProtocolSettings, MAX_EPOCH};
use unisync_imt::{Keccak256Hasher, TreeHasher};

use crate::config::AttesterSelection;
use crate::partitions::PartitionManager;
use crate::state::UnirepState;
use crate::storage::{
    AttestationRecord, AttesterRecord, HistoryTreeLeafRecord, NullifierRecord, Storage,
    TreeLeafRecord, UserSignUpRecord,
};

pub mod client;
pub mod entities;

pub use client::GraphqlClient;
use entities::*;

/// Logical schemas exposed by the subgraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    /// Attester registrations
    Attesters,
    /// User sign ups
    Users,
    /// State tree leaves
    StateTreeLeaves,
    /// Epoch tree leaves
    EpochTreeLeaves,
    /// Attestations
    Attestations,
    /// Consumed nullifiers
    Nullifiers,
    /// Sealed epochs
    Epochs,
    /// History tree leaves
    HistoryTreeLeaves,
}

impl Schema {
    /// Ingestion order.
    pub const ALL: [Schema; 8] = [
        Schema::Attesters,
        Schema::StateTreeLeaves,
        Schema::EpochTreeLeaves,
        Schema::Users,
        Schema::Attestations,
        Schema::Nullifiers,
        Schema::Epochs,
        Schema::HistoryTreeLeaves,
    ];

    /// Query field name.
    pub fn name(&self) -> &'static str {
        match self {
            Schema::Attesters => "attesters",
            Schema::Users => "users",
            Schema::StateTreeLeaves => "stateTreeLeaves",
            Schema::EpochTreeLeaves => "epochTreeLeaves",
            Schema::Attestations => "attestations",
            Schema::Nullifiers => "nullifiers",
            Schema::Epochs => "epochs",
            Schema::HistoryTreeLeaves => "historyTreeLeaves",
        }
    }

    /// Selected entity fields.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            Schema::Attesters => &["attesterId", "startTimestamp", "epochLength"],
            Schema::Users => &["commitment", "epoch", "attesterId", "blockNumber"],
            Schema::StateTreeLeaves | Schema::EpochTreeLeaves => {
                &["epoch", "leaf", "index", "attesterId", "blockNumber"]
            }
            Schema::Attestations => &[
                "epoch",
                "epochKey",
                "attesterId",
                "fieldIndex",
                "change",
                "blockNumber",
                "transactionIndex",
                "logIndex",
            ],
            Schema::Nullifiers => &[
                "nullifier",
                "attesterId",
                "epoch",
                "transactionHash",
                "blockNumber",
            ],
            Schema::Epochs => &["number", "attesterId"],
            Schema::HistoryTreeLeaves => &["attesterId", "leaf"],
        }
    }

    /// Filter applied to every query of this schema.
    pub fn base_filter(&self) -> Option<&'static str> {
        match self {
            // The genesis registration is not an attester
            Schema::Attesters => Some("attesterId_not: \"0\""),
            _ => None,
        }
    }
}

/// Sort order of a page query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOrder {
    /// Entity field to sort by
    pub field: &'static str,
    /// Descending instead of ascending
    pub descending: bool,
}

impl PageOrder {
    /// Emission order.
    pub fn chronological() -> Self {
        Self {
            field: "blockTimestamp",
            descending: false,
        }
    }

    /// Highest epoch number first.
    pub fn latest_epoch() -> Self {
        Self {
            field: "number",
            descending: true,
        }
    }
}

/// One `first`/`skip` page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Schema to read
    pub schema: Schema,
    /// Page size
    pub first: u64,
    /// Entities to skip
    pub skip: u64,
    /// Restrict to one attester
    pub attester_id: Option<AttesterId>,
    /// Sort order
    pub order: PageOrder,
}

/// Request/response query transport.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Entities of one page; an empty page ends the schema.
    async fn page(&self, query: &PageQuery) -> Result<Vec<Value>>;
}

/// Records written by one [`SubgraphSynchronizer::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSummary {
    /// Entities read
    pub read: u64,
    /// Entities that changed the store
    pub applied: u64,
}

/// Store writer fed by a paginated-query source.
///
/// `H` is the node hasher the read API rebuilds trees with.
pub struct SubgraphSynchronizer<H = Keccak256Hasher> {
    pages: Arc<dyn PageSource>,
    storage: Storage,
    partitions: PartitionManager,
    settings: ProtocolSettings,
    query_count: u64,
    hasher: H,
}

impl SubgraphSynchronizer {
    /// Create an adapter rebuilding keccak256 trees.
    pub fn new(
        pages: Arc<dyn PageSource>,
        storage: Storage,
        selection: &AttesterSelection,
        settings: ProtocolSettings,
        query_count: u64,
    ) -> Self {
        Self::with_hasher(pages, storage, selection, settings, query_count, Keccak256Hasher)
    }
}

impl<H: TreeHasher + 'static> SubgraphSynchronizer<H> {
    /// Create an adapter rebuilding trees with `hasher`.
    pub fn with_hasher(
        pages: Arc<dyn PageSource>,
        storage: Storage,
        selection: &AttesterSelection,
        settings: ProtocolSettings,
        query_count: u64,
        hasher: H,
    ) -> Self {
        Self {
            pages,
            storage,
            partitions: PartitionManager::new(selection),
            settings,
            query_count: query_count.max(1),
            hasher,
        }
    }

    async fn fetch_all<T: DeserializeOwned>(
        &self,
        schema: Schema,
        attester_id: Option<AttesterId>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for page in 0u64.. {
            let query = PageQuery {
                schema,
                first: self.query_count,
                skip: page * self.query_count,
                attester_id,
                order: PageOrder::chronological(),
            };
            let items = self.pages.page(&query).await?;
            if items.is_empty() {
                break;
            }
            debug!("Fetched {} {} (page {})", items.len(), schema.name(), page);
            for item in items {
                let entity = serde_json::from_value(item)
                    .with_context(|| format!("Malformed {} entity", schema.name()))?;
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// Ingest every schema, for one attester or all of them, in one transaction.
    pub async fn save(&self, attester_id: Option<AttesterId>) -> Result<SaveSummary> {
        let attesters: Vec<AttesterEntity> = self.fetch_all(Schema::Attesters, attester_id).await?;
        let state_leaves: Vec<TreeLeafEntity> =
            self.fetch_all(Schema::StateTreeLeaves, attester_id).await?;
        let epoch_leaves: Vec<TreeLeafEntity> =
            self.fetch_all(Schema::EpochTreeLeaves, attester_id).await?;
        let users: Vec<UserEntity> = self.fetch_all(Schema::Users, attester_id).await?;
        let attestations: Vec<AttestationEntity> =
            self.fetch_all(Schema::Attestations, attester_id).await?;
        let nullifiers: Vec<NullifierEntity> =
            self.fetch_all(Schema::Nullifiers, attester_id).await?;
        let epochs: Vec<EpochEntity> = self.fetch_all(Schema::Epochs, attester_id).await?;
        let history: Vec<HistoryTreeLeafEntity> =
            self.fetch_all(Schema::HistoryTreeLeaves, attester_id).await?;

        for a in &attesters {
            let setting = AttesterSetting {
                start_timestamp: a.start_timestamp,
                epoch_length: a.epoch_length,
            };
            if self.partitions.register(a.attester_id, setting) {
                info!("Tracking attester {}", a.attester_id);
            }
        }

        let mut summary = SaveSummary::default();
        let mut tx = self.storage.begin().await?;
        let conn: &mut SqliteConnection = &mut tx;

        for a in attesters.iter().filter(|a| self.partitions.is_tracked(&a.attester_id)) {
            let record = AttesterRecord {
                attester_id: a.attester_id,
                start_timestamp: a.start_timestamp,
                epoch_length: a.epoch_length,
            };
            summary.tally(Storage::upsert_attester(conn, &record).await?);
        }

        for l in state_leaves.iter().filter(|l| self.partitions.is_tracked(&l.attester_id)) {
            summary.tally(Storage::insert_state_tree_leaf(conn, &tree_leaf(l)).await?);
        }

        for l in epoch_leaves.iter().filter(|l| self.partitions.is_tracked(&l.attester_id)) {
            summary.tally(Storage::upsert_epoch_tree_leaf(conn, &tree_leaf(l)).await?);
        }

        for u in users.iter().filter(|u| self.partitions.is_tracked(&u.attester_id)) {
            let record = UserSignUpRecord {
                commitment: u.commitment,
                attester_id: u.attester_id,
                epoch: u.epoch,
                block_number: u.block_number,
            };
            summary.tally(Storage::insert_user_signup(conn, &record).await?);
        }

        for a in attestations.iter().filter(|a| self.partitions.is_tracked(&a.attester_id)) {
            let index =
                EventPosition::new(a.block_number, a.transaction_index, a.log_index).index_key();
            let record = AttestationRecord {
                index,
                attester_id: a.attester_id,
                epoch: a.epoch,
                epoch_key: a.epoch_key,
                field_index: a.field_index,
                change: a.change,
                block_number: a.block_number,
            };
            let inserted = Storage::insert_attestation(conn, &record).await?;
            if inserted && a.epoch != MAX_EPOCH {
                Storage::ensure_epoch(conn, a.attester_id, a.epoch).await?;
            }
            summary.tally(inserted);
        }

        for n in nullifiers.iter().filter(|n| self.partitions.is_tracked(&n.attester_id)) {
            let record = NullifierRecord {
                nullifier: n.nullifier,
                attester_id: n.attester_id,
                epoch: n.epoch,
                transaction_hash: n.transaction_hash,
                block_number: n.block_number,
            };
            summary.tally(Storage::insert_nullifier(conn, &record).await?);
        }

        for e in epochs.iter().filter(|e| self.partitions.is_tracked(&e.attester_id)) {
            let sealed = Storage::seal_epoch(conn, e.attester_id, e.number).await?;
            let opened =
                Storage::ensure_epoch(conn, e.attester_id, e.number.saturating_add(1)).await?;
            summary.tally(sealed || opened);
        }

        // Leaves are keyed by their position in the attester's ordered
        // stream so equal values stay distinct and re-ingestion is a no-op
        let mut positions: HashMap<AttesterId, u64> = HashMap::new();
        for h in history.iter().filter(|h| self.partitions.is_tracked(&h.attester_id)) {
            let position = positions.entry(h.attester_id).or_default();
            let record = HistoryTreeLeafRecord {
                attester_id: h.attester_id,
                index: *position,
                leaf: h.leaf,
            };
            *position += 1;
            summary.tally(Storage::insert_history_tree_leaf(conn, &record).await?);
        }

        tx.commit().await.context("Failed to commit subgraph ingestion")?;

        summary.read = [
            attesters.len(),
            state_leaves.len(),
            epoch_leaves.len(),
            users.len(),
            attestations.len(),
            nullifiers.len(),
            epochs.len(),
            history.len(),
        ]
        .iter()
        .sum::<usize>() as u64;

        info!(
            "Subgraph ingestion complete: {} entities read, {} applied",
            summary.read, summary.applied
        );
        Ok(summary)
    }
}

impl SaveSummary {
    fn tally(&mut self, changed: bool) {
        if changed {
            self.applied += 1;
        }
    }
}

fn tree_leaf(entity: &TreeLeafEntity) -> TreeLeafRecord {
    TreeLeafRecord {
        attester_id: entity.attester_id,
        epoch: entity.epoch,
        index: entity.index,
        hash: entity.leaf,
        block_number: entity.block_number,
    }
}

#[async_trait]
impl<H: TreeHasher + 'static> UnirepState for SubgraphSynchronizer<H> {
    type Hasher = H;

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn hasher(&self) -> &H {
        &self.hasher
    }

    fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    fn protocol_settings(&self) -> Result<ProtocolSettings> {
        Ok(self.settings)
    }

    /// Latest sealed epoch plus one, or 0 if no epoch was sealed.
    async fn load_current_epoch(&self, attester_id: Option<AttesterId>) -> Result<u64> {
        let id = self.resolve_attester(attester_id)?;
        let query = PageQuery {
            schema: Schema::Epochs,
            first: 1,
            skip: 0,
            attester_id: Some(id),
            order: PageOrder::latest_epoch(),
        };
        let items = self.pages.page(&query).await?;
        match items.into_iter().next() {
            Some(item) => {
                let epoch: EpochEntity =
                    serde_json::from_value(item).context("Malformed epochs entity")?;
                Ok(epoch.number.saturating_add(1))
            }
            None => Ok(0),
        }
    }
}
