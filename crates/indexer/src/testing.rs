//! In-memory test doubles for the chain and the subgraph.

use alloy::primitives::{aliases::U48, Address, LogData, B256, U256};
use alloy::sol_types::SolEvent;
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use unisync_core::{AttesterId, EventPosition, Field, ProtocolSettings};

use crate::listener::events::{attester_to_u160, Unirep};
use crate::listener::{EventFilter, EventSource, RawEvent};
use crate::subgraph::{PageQuery, PageSource, Schema};

#[derive(Default)]
struct Chain {
    head: u64,
    logs: Vec<RawEvent>,
    settings: ProtocolSettings,
    current_epochs: HashMap<AttesterId, u64>,
    epoch_roots: HashMap<(AttesterId, u64), Field>,
    state_roots: HashSet<(AttesterId, u64, Field)>,
    nullifiers: HashSet<Field>,
}

/// Scripted chain serving encoded Unirep logs.
pub struct MemorySource {
    address: Address,
    chain: Mutex<Chain>,
    failures: AtomicU64,
    queries: AtomicU64,
    ignore_topics: AtomicBool,
}

pub fn id(n: u64) -> AttesterId {
    AttesterId::from(n)
}

impl MemorySource {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            chain: Mutex::new(Chain {
                settings: ProtocolSettings {
                    state_tree_depth: 8,
                    epoch_tree_depth: 6,
                    history_tree_depth: 8,
                    num_epoch_key_nonce_per_epoch: 3,
                    field_count: 6,
                    sum_field_count: 4,
                    repl_nonce_bits: 48,
                    repl_field_bits: 205,
                },
                ..Default::default()
            }),
            failures: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            ignore_topics: AtomicBool::new(false),
        }
    }

    pub fn address_value(&self) -> Address {
        self.address
    }

    pub fn set_head(&self, head: u64) {
        self.chain.lock().head = head;
    }

    /// Fail the next `n` log queries.
    pub fn fail_next_queries(&self, n: u64) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Serve every log of the contract, as a node that drops topic filters.
    pub fn ignore_topic_filter(&self) {
        self.ignore_topics.store(true, Ordering::SeqCst);
    }

    /// Append a log whose `topic0` no handled event uses.
    pub fn push_unknown_log(&self, block: u64, tx: u64) -> RawEvent {
        let log = LogData::new_unchecked(vec![B256::repeat_byte(0xee)], Default::default());
        self.push_log(block, tx, log)
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn set_current_epoch(&self, attester: u64, epoch: u64) {
        self.chain.lock().current_epochs.insert(id(attester), epoch);
    }

    pub fn set_epoch_root(&self, attester: u64, epoch: u64, root: Field) {
        self.chain.lock().epoch_roots.insert((id(attester), epoch), root);
    }

    pub fn add_state_root(&self, attester: u64, epoch: u64, root: Field) {
        self.chain.lock().state_roots.insert((id(attester), epoch, root));
    }

    pub fn use_nullifier(&self, nullifier: Field) {
        self.chain.lock().nullifiers.insert(nullifier);
    }

    pub fn settings_value(&self) -> ProtocolSettings {
        self.chain.lock().settings
    }

    /// Append a log; its log index is the next free one in `block`.
    pub fn push_log(&self, block: u64, tx: u64, log: LogData) -> RawEvent {
        let mut chain = self.chain.lock();
        let log_index = chain
            .logs
            .iter()
            .filter(|e| e.block_number == block)
            .count() as u64;
        let raw = RawEvent {
            address: self.address,
            block_number: block,
            transaction_index: tx,
            log_index,
            topics: log.topics().to_vec(),
            data: log.data,
            transaction_hash: B256::from(U256::from(block * 1_000 + tx)),
        };
        chain.logs.push(raw.clone());
        chain.head = chain.head.max(block);
        raw
    }

    pub fn push_attester_signed_up(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch_length: u64,
        timestamp: u64,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::AttesterSignedUp {
                attesterId: attester_to_u160(id(attester)),
                epochLength: U48::from(epoch_length),
                timestamp: U48::from(timestamp),
            }
            .encode_log_data(),
        )
    }

    pub fn push_user_signed_up(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch: u64,
        commitment: u64,
        leaf_index: u64,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::UserSignedUp {
                epoch: U48::from(epoch),
                identityCommitment: U256::from(commitment),
                attesterId: attester_to_u160(id(attester)),
                leafIndex: U256::from(leaf_index),
            }
            .encode_log_data(),
        )
    }

    pub fn push_user_state_transitioned(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch: u64,
        leaf_index: u64,
        nullifier: u64,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::UserStateTransitioned {
                epoch: U48::from(epoch),
                attesterId: attester_to_u160(id(attester)),
                leafIndex: U256::from(leaf_index),
                hashedLeaf: U256::from(nullifier + 1),
                nullifier: U256::from(nullifier),
            }
            .encode_log_data(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn push_attestation(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch: u64,
        epoch_key: u64,
        field_index: u64,
        change: u64,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::Attestation {
                epoch: U48::from(epoch),
                epochKey: U256::from(epoch_key),
                attesterId: attester_to_u160(id(attester)),
                fieldIndex: U256::from(field_index),
                change: U256::from(change),
            }
            .encode_log_data(),
        )
    }

    pub fn push_state_tree_leaf(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch: u64,
        index: u64,
        leaf: Field,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::StateTreeLeaf {
                epoch: U48::from(epoch),
                attesterId: attester_to_u160(id(attester)),
                index: U256::from(index),
                leaf,
            }
            .encode_log_data(),
        )
    }

    pub fn push_epoch_tree_leaf(
        &self,
        block: u64,
        tx: u64,
        attester: u64,
        epoch: u64,
        index: u64,
        leaf: Field,
    ) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::EpochTreeLeaf {
                epoch: U48::from(epoch),
                attesterId: attester_to_u160(id(attester)),
                index: U256::from(index),
                leaf,
            }
            .encode_log_data(),
        )
    }

    pub fn push_history_tree_leaf(&self, block: u64, tx: u64, attester: u64, leaf: Field) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::HistoryTreeLeaf {
                attesterId: attester_to_u160(id(attester)),
                leaf,
            }
            .encode_log_data(),
        )
    }

    pub fn push_epoch_ended(&self, block: u64, tx: u64, attester: u64, epoch: u64) -> RawEvent {
        self.push_log(
            block,
            tx,
            Unirep::EpochEnded {
                epoch: U48::from(epoch),
                attesterId: attester_to_u160(id(attester)),
            }
            .encode_log_data(),
        )
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn address(&self) -> Address {
        self.address
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.chain.lock().head)
    }

    async fn query_filter(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            bail!("injected transient failure");
        }

        let chain = self.chain.lock();
        // Newest first, so callers cannot rely on source order
        let mut events: Vec<RawEvent> = chain
            .logs
            .iter()
            .filter(|e| e.block_number >= from_block && e.block_number <= to_block)
            .filter(|e| {
                if self.ignore_topics.load(Ordering::SeqCst) {
                    e.address == filter.address
                } else {
                    filter.matches(e)
                }
            })
            .cloned()
            .collect();
        events.reverse();
        Ok(events)
    }

    async fn settings(&self) -> Result<ProtocolSettings> {
        Ok(self.chain.lock().settings)
    }

    async fn attester_current_epoch(&self, attester_id: AttesterId) -> Result<u64> {
        Ok(self
            .chain
            .lock()
            .current_epochs
            .get(&attester_id)
            .copied()
            .unwrap_or(0))
    }

    async fn attester_epoch_root(&self, attester_id: AttesterId, epoch: u64) -> Result<Field> {
        Ok(self
            .chain
            .lock()
            .epoch_roots
            .get(&(attester_id, epoch))
            .copied()
            .unwrap_or_default())
    }

    async fn state_tree_root_exists(
        &self,
        attester_id: AttesterId,
        epoch: u64,
        root: Field,
    ) -> Result<bool> {
        Ok(self
            .chain
            .lock()
            .state_roots
            .contains(&(attester_id, epoch, root)))
    }

    async fn nullifier_used(&self, nullifier: Field) -> Result<bool> {
        Ok(self.chain.lock().nullifiers.contains(&nullifier))
    }
}

/// Scripted subgraph: entities per schema in emission order.
#[derive(Default)]
pub struct MemoryPages {
    entities: Mutex<HashMap<Schema, Vec<Value>>>,
    requests: AtomicU64,
}

impl MemoryPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, schema: Schema, entity: Value) {
        self.entities.lock().entry(schema).or_default().push(entity);
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageSource for MemoryPages {
    async fn page(&self, query: &PageQuery) -> Result<Vec<Value>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let entities = self.entities.lock();
        let mut items: Vec<Value> = entities
            .get(&query.schema)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|e| match query.attester_id {
                Some(id) => e["attesterId"] == json!(id.to_string()),
                None => true,
            })
            .filter(|e| query.schema != Schema::Attesters || e["attesterId"] != json!("0"))
            .collect();

        if query.order.field == "number" {
            items.sort_by_key(|e| e["number"].as_str().and_then(|n| n.parse::<u64>().ok()));
            if query.order.descending {
                items.reverse();
            }
        }

        Ok(items
            .into_iter()
            .skip(query.skip as usize)
            .take(query.first as usize)
            .collect())
    }
}

/// Records one event history into both a [`MemorySource`] and a
/// [`MemoryPages`].
pub struct History<'a> {
    pub source: &'a MemorySource,
    pub pages: &'a MemoryPages,
}

impl History<'_> {
    pub fn attester_signed_up(&self, block: u64, attester: u64, epoch_length: u64, timestamp: u64) {
        self.source
            .push_attester_signed_up(block, 0, attester, epoch_length, timestamp);
        self.pages.push(
            Schema::Attesters,
            json!({
                "attesterId": id(attester).to_string(),
                "startTimestamp": timestamp.to_string(),
                "epochLength": epoch_length.to_string(),
            }),
        );
    }

    /// Sign up plus the state tree leaf it inserts.
    pub fn user_signed_up(&self, block: u64, attester: u64, epoch: u64, commitment: u64, index: u64) {
        let leaf = U256::from(commitment * 31 + 7);
        self.source
            .push_user_signed_up(block, 0, attester, epoch, commitment, index);
        self.source
            .push_state_tree_leaf(block, 0, attester, epoch, index, leaf);
        self.pages.push(
            Schema::Users,
            json!({
                "commitment": commitment.to_string(),
                "epoch": epoch.to_string(),
                "attesterId": id(attester).to_string(),
                "blockNumber": block.to_string(),
            }),
        );
        self.pages.push(
            Schema::StateTreeLeaves,
            json!({
                "epoch": epoch.to_string(),
                "leaf": leaf.to_string(),
                "index": index.to_string(),
                "attesterId": id(attester).to_string(),
                "blockNumber": block.to_string(),
            }),
        );
    }

    pub fn attestation(
        &self,
        block: u64,
        attester: u64,
        epoch: u64,
        epoch_key: u64,
        field_index: u64,
        change: u64,
    ) -> EventPosition {
        let raw =
            self.source
                .push_attestation(block, 0, attester, epoch, epoch_key, field_index, change);
        self.pages.push(
            Schema::Attestations,
            json!({
                "epoch": epoch.to_string(),
                "epochKey": epoch_key.to_string(),
                "attesterId": id(attester).to_string(),
                "fieldIndex": field_index.to_string(),
                "change": change.to_string(),
                "blockNumber": block.to_string(),
                "transactionIndex": raw.transaction_index.to_string(),
                "logIndex": raw.log_index.to_string(),
            }),
        );
        raw.position()
    }

    pub fn epoch_tree_leaf(&self, block: u64, attester: u64, epoch: u64, index: u64, leaf: u64) {
        self.source
            .push_epoch_tree_leaf(block, 0, attester, epoch, index, U256::from(leaf));
        self.pages.push(
            Schema::EpochTreeLeaves,
            json!({
                "epoch": epoch.to_string(),
                "leaf": leaf.to_string(),
                "index": index.to_string(),
                "attesterId": id(attester).to_string(),
                "blockNumber": block.to_string(),
            }),
        );
    }

    pub fn user_state_transitioned(&self, block: u64, attester: u64, epoch: u64, nullifier: u64) {
        let raw = self
            .source
            .push_user_state_transitioned(block, 0, attester, epoch, 0, nullifier);
        self.pages.push(
            Schema::Nullifiers,
            json!({
                "nullifier": nullifier.to_string(),
                "attesterId": id(attester).to_string(),
                "epoch": epoch.to_string(),
                "transactionHash": raw.transaction_hash.to_string(),
                "blockNumber": block.to_string(),
            }),
        );
    }

    pub fn epoch_ended(&self, block: u64, attester: u64, epoch: u64, history_leaf: u64) {
        self.source.push_epoch_ended(block, 0, attester, epoch);
        self.source
            .push_history_tree_leaf(block, 0, attester, U256::from(history_leaf));
        self.pages.push(
            Schema::Epochs,
            json!({
                "number": epoch.to_string(),
                "attesterId": id(attester).to_string(),
            }),
        );
        self.pages.push(
            Schema::HistoryTreeLeaves,
            json!({
                "attesterId": id(attester).to_string(),
                "leaf": history_leaf.to_string(),
            }),
        );
    }
}
