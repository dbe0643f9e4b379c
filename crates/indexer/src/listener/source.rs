//! Event source capability.

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::Log;
use anyhow::{Context, Result};
use async_trait::async_trait;
use unisync_core::{AttesterId, EventPosition, Field, ProtocolSettings};

/// An undecoded log with its chain coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// Emitting contract
    pub address: Address,

    /// Block number where the event occurred
    pub block_number: u64,

    /// Transaction index within the block
    pub transaction_index: u64,

    /// Log index within the block
    pub log_index: u64,

    /// Indexed topics; `topics[0]` is the event signature
    pub topics: Vec<B256>,

    /// ABI-encoded non-indexed fields
    pub data: Bytes,

    /// Transaction hash
    pub transaction_hash: B256,
}

impl RawEvent {
    /// Convert an RPC log.
    pub fn from_log(log: &Log) -> Result<Self> {
        Ok(Self {
            address: log.inner.address,
            block_number: log.block_number.context("Log missing block_number")?,
            transaction_index: log
                .transaction_index
                .context("Log missing transaction_index")?,
            log_index: log.log_index.context("Log missing log_index")?,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            transaction_hash: log
                .transaction_hash
                .context("Log missing transaction_hash")?,
        })
    }

    /// Canonical position.
    pub fn position(&self) -> EventPosition {
        EventPosition::new(self.block_number, self.transaction_index, self.log_index)
    }

    /// Event signature topic.
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

/// Log filter: one address, an OR-set of signatures and optionally an
/// OR-set of first indexed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventFilter {
    /// Emitting contract
    pub address: Address,

    /// Accepted event signatures (empty matches any)
    pub topic0: Vec<B256>,

    /// Accepted first indexed argument (empty matches any)
    pub topic1: Vec<B256>,
}

impl EventFilter {
    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &RawEvent) -> bool {
        let topic_ok = |set: &[B256], idx: usize| {
            set.is_empty() || event.topics.get(idx).is_some_and(|t| set.contains(t))
        };
        event.address == self.address && topic_ok(&self.topic0, 0) && topic_ok(&self.topic1, 1)
    }
}

/// Everything the synchronizer needs from the chain.
///
/// The JSON-RPC implementation is [`crate::listener::RpcProvider`].
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Contract being synchronized.
    fn address(&self) -> Address;

    /// Current head block number.
    async fn block_number(&self) -> Result<u64>;

    /// Logs matching `filter` in `from_block..=to_block`.
    async fn query_filter(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>>;

    /// Protocol tree depths and field parameters.
    async fn settings(&self) -> Result<ProtocolSettings>;

    /// Live epoch of an attester.
    async fn attester_current_epoch(&self, attester_id: AttesterId) -> Result<u64>;

    /// Epoch tree root committed for a sealed epoch.
    async fn attester_epoch_root(&self, attester_id: AttesterId, epoch: u64) -> Result<Field>;

    /// Whether `root` was ever a state tree root of the attester's epoch.
    async fn state_tree_root_exists(
        &self,
        attester_id: AttesterId,
        epoch: u64,
        root: Field,
    ) -> Result<bool>;

    /// Whether a nullifier has been consumed.
    async fn nullifier_used(&self, nullifier: Field) -> Result<bool>;
}
