//! JSON-RPC event source.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{Client, Http};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;
use unisync_core::{AttesterId, Field, ProtocolSettings};

use super::events::{attester_to_u160, from_u48, to_u48, Unirep};
use super::source::{EventFilter, EventSource, RawEvent};

/// HTTP RPC provider for querying the Unirep contract.
#[derive(Clone)]
pub struct RpcProvider {
    provider: RootProvider<Http<Client>>,
    unirep_address: Address,
}

impl RpcProvider {
    /// Create a new RPC provider.
    pub async fn new(rpc_url: &str, unirep_address: Address) -> Result<Self> {
        let url = rpc_url
            .parse()
            .with_context(|| format!("Invalid RPC URL: {}", rpc_url))?;

        let provider = ProviderBuilder::new().on_http(url);

        Ok(Self {
            provider,
            unirep_address,
        })
    }

    /// Chain id reported by the node.
    pub async fn chain_id(&self) -> Result<u64> {
        self.provider
            .get_chain_id()
            .await
            .context("Failed to get chain id")
    }

    fn contract(&self) -> Unirep::UnirepInstance<Http<Client>, RootProvider<Http<Client>>> {
        Unirep::new(self.unirep_address, self.provider.clone())
    }
}

#[async_trait]
impl EventSource for RpcProvider {
    fn address(&self) -> Address {
        self.unirep_address
    }

    async fn block_number(&self) -> Result<u64> {
        self.provider
            .get_block_number()
            .await
            .context("Failed to get block number")
    }

    async fn query_filter(
        &self,
        filter: &EventFilter,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>> {
        let mut rpc_filter = Filter::new()
            .address(filter.address)
            .from_block(from_block)
            .to_block(to_block);
        if !filter.topic0.is_empty() {
            rpc_filter = rpc_filter.event_signature(filter.topic0.clone());
        }
        if !filter.topic1.is_empty() {
            rpc_filter = rpc_filter.topic1(filter.topic1.clone());
        }

        let logs: Vec<Log> = self
            .provider
            .get_logs(&rpc_filter)
            .await
            .with_context(|| {
                format!("Failed to fetch logs for blocks {} to {}", from_block, to_block)
            })?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.removed {
                warn!(
                    "Skipping removed log in block {:?} (reorg)",
                    log.block_number
                );
                continue;
            }
            events.push(RawEvent::from_log(log)?);
        }

        Ok(events)
    }

    async fn settings(&self) -> Result<ProtocolSettings> {
        let contract = self.contract();
        let ctx = "Failed to read protocol settings";

        Ok(ProtocolSettings {
            state_tree_depth: contract.stateTreeDepth().call().await.context(ctx)?._0,
            epoch_tree_depth: contract.epochTreeDepth().call().await.context(ctx)?._0,
            history_tree_depth: contract.historyTreeDepth().call().await.context(ctx)?._0,
            num_epoch_key_nonce_per_epoch: contract
                .numEpochKeyNoncePerEpoch()
                .call()
                .await
                .context(ctx)?
                ._0,
            field_count: contract.fieldCount().call().await.context(ctx)?._0,
            sum_field_count: contract.sumFieldCount().call().await.context(ctx)?._0,
            repl_nonce_bits: contract.replNonceBits().call().await.context(ctx)?._0,
            repl_field_bits: contract.replFieldBits().call().await.context(ctx)?._0,
        })
    }

    async fn attester_current_epoch(&self, attester_id: AttesterId) -> Result<u64> {
        let epoch = self
            .contract()
            .attesterCurrentEpoch(attester_to_u160(attester_id))
            .call()
            .await
            .with_context(|| format!("Failed to query current epoch of attester {}", attester_id))?
            ._0;
        Ok(from_u48(epoch))
    }

    async fn attester_epoch_root(&self, attester_id: AttesterId, epoch: u64) -> Result<Field> {
        let root = self
            .contract()
            .attesterEpochRoot(attester_to_u160(attester_id), to_u48(epoch, "epoch")?)
            .call()
            .await
            .with_context(|| {
                format!(
                    "Failed to query epoch {} root of attester {}",
                    epoch, attester_id
                )
            })?
            ._0;
        Ok(root)
    }

    async fn state_tree_root_exists(
        &self,
        attester_id: AttesterId,
        epoch: u64,
        root: Field,
    ) -> Result<bool> {
        let exists = self
            .contract()
            .attesterStateTreeRootExists(
                attester_to_u160(attester_id),
                to_u48(epoch, "epoch")?,
                root,
            )
            .call()
            .await
            .context("Failed to query state tree root")?
            ._0;
        Ok(exists)
    }

    async fn nullifier_used(&self, nullifier: Field) -> Result<bool> {
        let used = self
            .contract()
            .usedNullifiers(nullifier)
            .call()
            .await
            .context("Failed to query nullifier")?
            ._0;
        Ok(used)
    }
}
