//! Merkle tree projections over persisted leaves.

use anyhow::{Context, Result};
use unisync_core::{
    AttesterId, Field, ProtocolSettings, DEFAULT_EPOCH_TREE_LEAF, DEFAULT_HISTORY_TREE_LEAF,
    DEFAULT_STATE_TREE_LEAF,
};
use unisync_imt::{IncrementalMerkleTree, Keccak256Hasher, MerkleProof, TreeHasher};

use crate::storage::Storage;

/// The trees kept per attester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    /// Per-epoch user state tree
    State,
    /// Per-epoch epoch key tree
    Epoch,
    /// Attester-wide history tree
    History,
}

impl TreeKind {
    /// Depth of this tree under `settings`.
    pub fn depth(&self, settings: &ProtocolSettings) -> u8 {
        match self {
            TreeKind::State => settings.state_tree_depth,
            TreeKind::Epoch => settings.epoch_tree_depth,
            TreeKind::History => settings.history_tree_depth,
        }
    }

    /// Value of an empty leaf.
    pub fn default_leaf(&self) -> Field {
        match self {
            TreeKind::State => DEFAULT_STATE_TREE_LEAF,
            TreeKind::Epoch => DEFAULT_EPOCH_TREE_LEAF,
            TreeKind::History => DEFAULT_HISTORY_TREE_LEAF,
        }
    }
}

/// Rebuilds trees from committed leaves. Holds no tree state of its own.
#[derive(Debug, Clone)]
pub struct TreeRebuilder<H = Keccak256Hasher> {
    storage: Storage,
    settings: ProtocolSettings,
    hasher: H,
}

impl TreeRebuilder<Keccak256Hasher> {
    /// Rebuilder using the default hasher.
    pub fn new(storage: Storage, settings: ProtocolSettings) -> Self {
        Self::with_hasher(storage, settings, Keccak256Hasher)
    }
}

impl<H: TreeHasher> TreeRebuilder<H> {
    /// Rebuilder using `hasher`.
    pub fn with_hasher(storage: Storage, settings: ProtocolSettings, hasher: H) -> Self {
        Self {
            storage,
            settings,
            hasher,
        }
    }

    /// Protocol settings the trees are sized by.
    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    fn build(&self, kind: TreeKind, leaves: Vec<Field>) -> Result<IncrementalMerkleTree<H>> {
        let mut tree = IncrementalMerkleTree::with_hasher(
            kind.depth(&self.settings),
            kind.default_leaf(),
            self.hasher.clone(),
        )?;
        for leaf in leaves {
            tree.insert(leaf)
                .with_context(|| format!("Failed to rebuild {:?} tree", kind))?;
        }
        Ok(tree)
    }

    /// State tree of an attester's epoch.
    pub async fn state_tree(
        &self,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<IncrementalMerkleTree<H>> {
        let leaves = self.storage.state_tree_leaves(attester_id, epoch).await?;
        self.build(TreeKind::State, leaves)
    }

    /// Epoch tree of an attester's epoch.
    ///
    /// Leaves are inserted densely in ascending index order, so a gap in the
    /// stored indices shifts every later leaf down to the next free slot.
    pub async fn epoch_tree(
        &self,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<IncrementalMerkleTree<H>> {
        let leaves = self
            .storage
            .epoch_tree_leaves(attester_id, epoch)
            .await?
            .into_iter()
            .map(|l| l.hash)
            .collect();
        self.build(TreeKind::Epoch, leaves)
    }

    /// History tree of an attester.
    pub async fn history_tree(&self, attester_id: AttesterId) -> Result<IncrementalMerkleTree<H>> {
        let leaves = self
            .storage
            .history_tree_leaves(attester_id)
            .await?
            .into_iter()
            .map(|l| l.leaf)
            .collect();
        self.build(TreeKind::History, leaves)
    }

    /// Any tree by kind; `epoch` is ignored for the history tree.
    pub async fn tree(
        &self,
        kind: TreeKind,
        attester_id: AttesterId,
        epoch: u64,
    ) -> Result<IncrementalMerkleTree<H>> {
        match kind {
            TreeKind::State => self.state_tree(attester_id, epoch).await,
            TreeKind::Epoch => self.epoch_tree(attester_id, epoch).await,
            TreeKind::History => self.history_tree(attester_id).await,
        }
    }

    /// Inclusion proof for an epoch tree leaf.
    ///
    /// `leaf_index` is the slot in the rebuilt tree (see
    /// [`TreeRebuilder::epoch_tree`]), not the stored leaf index.
    pub async fn epoch_tree_proof(
        &self,
        attester_id: AttesterId,
        epoch: u64,
        leaf_index: usize,
    ) -> Result<MerkleProof> {
        let tree = self.epoch_tree(attester_id, epoch).await?;
        Ok(tree.create_proof(leaf_index)?)
    }
}
