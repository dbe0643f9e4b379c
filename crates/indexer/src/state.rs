//! Read API shared by the live and paginated-query adapters.

use anyhow::Result;
use async_trait::async_trait;
use unisync_core::{AttesterId, ProtocolSettings};
use unisync_imt::{IncrementalMerkleTree, MerkleProof, TreeHasher};

use crate::partitions::PartitionManager;
use crate::rebuild::TreeRebuilder;
use crate::storage::{EpochRecord, Storage};

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Attester state backed by a store both adapters write to.
///
/// Every method taking `attester_id: Option<AttesterId>` falls back to the
/// default attester on `None` and rejects untracked attesters.
#[async_trait]
pub trait UnirepState: Send + Sync {
    /// Node hasher of the rebuilt trees. Roots only match the contract's
    /// when this is the contract's hash function.
    type Hasher: TreeHasher + 'static;

    /// Store holding the synchronized state.
    fn storage(&self) -> &Storage;

    /// Hasher the trees are rebuilt with.
    fn hasher(&self) -> &Self::Hasher;

    /// Tracked attesters.
    fn partitions(&self) -> &PartitionManager;

    /// Protocol settings; fails before setup.
    fn protocol_settings(&self) -> Result<ProtocolSettings>;

    /// Authoritative current epoch of an attester.
    async fn load_current_epoch(&self, attester_id: Option<AttesterId>) -> Result<u64>;

    /// Default attester.
    fn attester_id(&self) -> Result<AttesterId> {
        self.partitions().default_attester()
    }

    /// Re-point the default attester.
    fn set_attester_id(&self, attester_id: AttesterId) -> Result<()> {
        self.partitions().set_default(attester_id)
    }

    /// Fail unless `attester_id` is synchronized.
    fn check_attester_id(&self, attester_id: AttesterId) -> Result<()> {
        self.partitions().check(attester_id)
    }

    /// Resolve an optional attester argument.
    fn resolve_attester(&self, attester_id: Option<AttesterId>) -> Result<AttesterId> {
        match attester_id {
            Some(id) => {
                self.check_attester_id(id)?;
                Ok(id)
            }
            None => self.attester_id(),
        }
    }

    /// Latest persisted epoch, `{0, open}` if none.
    async fn read_current_epoch(&self, attester_id: Option<AttesterId>) -> Result<EpochRecord> {
        let id = self.resolve_attester(attester_id)?;
        self.storage().read_latest_epoch(id).await
    }

    /// Estimated current epoch from the attester's epoch clock.
    fn calc_current_epoch(&self, attester_id: Option<AttesterId>) -> Result<u64> {
        let id = self.resolve_attester(attester_id)?;
        self.partitions().calc_current_epoch(id, unix_now())
    }

    /// Seconds left in the estimated current epoch.
    fn calc_epoch_remaining_time(&self, attester_id: Option<AttesterId>) -> Result<u64> {
        let id = self.resolve_attester(attester_id)?;
        self.partitions().calc_epoch_remaining_time(id, unix_now())
    }

    /// Tree rebuilder over this store.
    fn rebuilder(&self) -> Result<TreeRebuilder<Self::Hasher>> {
        Ok(TreeRebuilder::with_hasher(
            self.storage().clone(),
            self.protocol_settings()?,
            self.hasher().clone(),
        ))
    }

    /// State tree of an epoch.
    async fn gen_state_tree(
        &self,
        epoch: u64,
        attester_id: Option<AttesterId>,
    ) -> Result<IncrementalMerkleTree<Self::Hasher>> {
        let id = self.resolve_attester(attester_id)?;
        self.rebuilder()?.state_tree(id, epoch).await
    }

    /// Epoch tree of an epoch.
    async fn gen_epoch_tree(
        &self,
        epoch: u64,
        attester_id: Option<AttesterId>,
    ) -> Result<IncrementalMerkleTree<Self::Hasher>> {
        let id = self.resolve_attester(attester_id)?;
        self.rebuilder()?.epoch_tree(id, epoch).await
    }

    /// History tree.
    async fn gen_history_tree(
        &self,
        attester_id: Option<AttesterId>,
    ) -> Result<IncrementalMerkleTree<Self::Hasher>> {
        let id = self.resolve_attester(attester_id)?;
        self.rebuilder()?.history_tree(id).await
    }

    /// Inclusion proof for an epoch tree leaf.
    async fn epoch_tree_proof(
        &self,
        epoch: u64,
        leaf_index: usize,
        attester_id: Option<AttesterId>,
    ) -> Result<MerkleProof> {
        let id = self.resolve_attester(attester_id)?;
        self.rebuilder()?.epoch_tree_proof(id, epoch, leaf_index).await
    }

    /// Number of state tree leaves in an epoch.
    async fn num_state_tree_leaves(
        &self,
        epoch: u64,
        attester_id: Option<AttesterId>,
    ) -> Result<u64> {
        let id = self.resolve_attester(attester_id)?;
        self.storage().count_state_tree_leaves(id, epoch).await
    }
}
