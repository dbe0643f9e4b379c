//! Live-event synchronizer.
//!
//! Drives load, order and apply cycles against an [`EventSource`]:
//!
//! ```text
//!   idle ──start()──▶ catching_up ──head reached──▶ steady_state
//!                         │                              │
//!                         └────────────stop()────────────┴──▶ stopped
//! ```
//!
//! Each event's mutations and the cursor advance guarding them commit in
//! one transaction, so a restart resumes at the last committed event.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use unisync_core::{AttesterId, Field, ProtocolSettings};
use unisync_imt::{Keccak256Hasher, TreeHasher};

use crate::config::SyncOptions;
use crate::error::{classify, SyncError};
use crate::handlers::{self, ApplyContext, HandlerOutcome};
use crate::listener::{EventDecoder, EventLoader, EventSource, RawEvent, RunControl, RunToken};
use crate::notify::{Notification, Notifier};
use crate::ordering::{filter_unprocessed, sort_canonical};
use crate::partitions::PartitionManager;
use crate::state::UnirepState;
use crate::storage::Storage;

/// Scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Not started
    Idle,
    /// Loading a bounded window per cycle until the head is reached
    CatchingUp,
    /// Polling at a fixed interval
    SteadyState,
    /// Stopped until the next `start()`
    Stopped,
}

/// Result of one poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Whether the synced height reached the head observed by this cycle
    pub complete: bool,
    /// Highest block now complete
    pub synced_to: u64,
    /// Head observed by this cycle
    pub head: u64,
    /// Events that changed the store
    pub applied: usize,
}

struct Inner {
    source: Arc<dyn EventSource>,
    storage: Storage,
    partitions: PartitionManager,
    decoder: EventDecoder,
    loader: EventLoader,
    notifier: Notifier,
    options: SyncOptions,
    settings: OnceCell<ProtocolSettings>,
    poll_lock: Mutex<()>,
    run: RunControl,
    phase: watch::Sender<SyncPhase>,
}

/// Synchronizes attester state from contract events into a [`Storage`].
///
/// `H` is the node hasher the read API rebuilds trees with. Cheap to clone;
/// clones share the same scheduler.
#[derive(Clone)]
pub struct Synchronizer<H = Keccak256Hasher> {
    inner: Arc<Inner>,
    hasher: H,
}

impl Synchronizer {
    /// Create a synchronizer rebuilding keccak256 trees. Call
    /// [`Synchronizer::setup`] or [`Synchronizer::start`] before polling.
    pub fn new(source: Arc<dyn EventSource>, storage: Storage, options: SyncOptions) -> Result<Self> {
        Self::with_hasher(source, storage, options, Keccak256Hasher)
    }
}

impl<H: TreeHasher + 'static> Synchronizer<H> {
    /// Create a synchronizer rebuilding trees with `hasher`.
    pub fn with_hasher(
        source: Arc<dyn EventSource>,
        storage: Storage,
        options: SyncOptions,
        hasher: H,
    ) -> Result<Self> {
        let decoder = EventDecoder::new()?;
        let loader = EventLoader::new(
            source.clone(),
            decoder.filter(source.address()),
            options.block_rate,
            options.min_backoff,
            options.max_backoff,
        );
        let (phase, _) = watch::channel(SyncPhase::Idle);

        Ok(Self {
            inner: Arc::new(Inner {
                partitions: PartitionManager::new(&options.attesters),
                source,
                storage,
                decoder,
                loader,
                notifier: Notifier::default(),
                options,
                settings: OnceCell::new(),
                poll_lock: Mutex::new(()),
                run: RunControl::new(),
                phase,
            }),
            hasher,
        })
    }

    /// Read protocol settings and run the genesis scan. Runs once; a failed
    /// setup can be retried.
    pub async fn setup(&self) -> Result<ProtocolSettings> {
        let inner = &self.inner;
        let settings = inner
            .settings
            .get_or_try_init(|| async {
                let settings = inner.source.settings().await?;
                inner
                    .partitions
                    .discover(
                        inner.source.clone(),
                        &inner.storage,
                        inner.options.start_block,
                        &inner.loader,
                        &RunToken::detached(),
                    )
                    .await
                    .context("Synchronizer setup failed")?;
                info!(
                    "Synchronizer set up for {} attester(s)",
                    inner.partitions.tracked().len()
                );
                Ok::<_, anyhow::Error>(settings)
            })
            .await?;
        Ok(*settings)
    }

    /// Whether setup completed.
    pub fn is_set_up(&self) -> bool {
        self.inner.settings.initialized()
    }

    /// Set up if needed and spawn the polling loop.
    ///
    /// Any previously started loop exits at its next iteration boundary.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        self.setup().await?;
        let token = self.inner.run.issue();
        let inner = self.inner.clone();
        info!("Synchronizer started");
        Ok(tokio::spawn(async move { inner.run_loop(token).await }))
    }

    /// Stop the polling loop after its current iteration.
    pub fn stop(&self) {
        self.inner.run.stop();
        self.inner.phase.send_replace(SyncPhase::Stopped);
        info!("Synchronizer stopped");
    }

    /// One load and apply cycle. Serialized with the polling loop.
    pub async fn poll(&self) -> Result<PollOutcome> {
        self.inner.poll(&RunToken::detached()).await
    }

    /// Current scheduler state.
    pub fn phase(&self) -> SyncPhase {
        *self.inner.phase.borrow()
    }

    /// Scheduler state changes.
    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Subscriber registry.
    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    /// Event source.
    pub fn source(&self) -> &Arc<dyn EventSource> {
        &self.inner.source
    }

    /// Block until every tracked attester is complete up to `block`
    /// (default: the head at call time).
    ///
    /// Never returns if the scheduler is stopped before reaching it.
    pub async fn wait_for_sync(&self, block: Option<u64>) -> Result<()> {
        let target = match block {
            Some(b) => b,
            None => self.inner.source.block_number().await?,
        };
        loop {
            let keys = self.inner.partitions.cursor_keys();
            let cursor = self.inner.storage.lowest_cursor(&keys).await?;
            if cursor.is_some_and(|c| c.is_complete_to(target)) {
                return Ok(());
            }
            tokio::time::sleep(self.inner.options.wait_interval).await;
        }
    }

    /// Whether `root` was a state tree root of the epoch, per the contract.
    pub async fn state_tree_root_exists(
        &self,
        root: Field,
        epoch: u64,
        attester_id: Option<AttesterId>,
    ) -> Result<bool> {
        let id = self.resolve_attester(attester_id)?;
        self.inner.source.state_tree_root_exists(id, epoch, root).await
    }

    /// Whether `root` is the committed epoch tree root of the epoch.
    pub async fn epoch_tree_root_exists(
        &self,
        root: Field,
        epoch: u64,
        attester_id: Option<AttesterId>,
    ) -> Result<bool> {
        let id = self.resolve_attester(attester_id)?;
        Ok(self.inner.source.attester_epoch_root(id, epoch).await? == root)
    }

    /// Whether the contract has seen `nullifier`.
    pub async fn nullifier_exist(&self, nullifier: Field) -> Result<bool> {
        self.inner.source.nullifier_used(nullifier).await
    }
}

#[async_trait]
impl<H: TreeHasher + 'static> UnirepState for Synchronizer<H> {
    type Hasher = H;

    fn storage(&self) -> &Storage {
        &self.inner.storage
    }

    fn hasher(&self) -> &H {
        &self.hasher
    }

    fn partitions(&self) -> &PartitionManager {
        &self.inner.partitions
    }

    fn protocol_settings(&self) -> Result<ProtocolSettings> {
        self.inner
            .settings
            .get()
            .copied()
            .ok_or_else(|| SyncError::NotSetUp.into())
    }

    async fn load_current_epoch(&self, attester_id: Option<AttesterId>) -> Result<u64> {
        let id = self.resolve_attester(attester_id)?;
        self.inner.source.attester_current_epoch(id).await
    }
}

impl Inner {
    fn set_phase(&self, token: &RunToken, phase: SyncPhase) {
        if token.is_live() {
            self.phase.send_replace(phase);
        }
    }

    async fn run_loop(&self, token: RunToken) {
        let min = self.options.min_backoff;
        let max = self.options.max_backoff.max(min);
        let mut backoff = min;

        self.set_phase(&token, SyncPhase::CatchingUp);
        loop {
            match self.poll(&token).await {
                Ok(outcome) if outcome.complete => break,
                Ok(_) => backoff = (backoff / 2).max(min),
                Err(e) => {
                    if matches!(classify(&e), Some(SyncError::Cancelled)) {
                        return;
                    }
                    error!("Unirep poll failed: {:#}", e);
                    backoff = (backoff * 2).min(max);
                }
            }
            tokio::time::sleep(backoff).await;
            if !token.is_live() {
                return;
            }
        }

        self.set_phase(&token, SyncPhase::SteadyState);
        info!("Caught up with chain head");

        loop {
            tokio::time::sleep(self.options.poll_interval).await;
            if !token.is_live() {
                return;
            }
            if let Err(e) = self.poll(&token).await {
                if matches!(classify(&e), Some(SyncError::Cancelled)) {
                    return;
                }
                error!("Unirep poll failed: {:#}", e);
            }
        }
    }

    async fn poll(&self, token: &RunToken) -> Result<PollOutcome> {
        let _guard = self.poll_lock.lock().await;

        if !self.settings.initialized() {
            warn!("Polled before setup");
            return Err(SyncError::NotSetUp.into());
        }
        self.notifier.emit(Notification::PollStart);

        let keys = self.partitions.cursor_keys();
        let cursor = self
            .storage
            .lowest_cursor(&keys)
            .await?
            .ok_or(SyncError::NotSetUp)?;
        let head = self.source.block_number().await?;

        let from = cursor.next_block();
        if from > head {
            return Ok(PollOutcome {
                complete: true,
                synced_to: head,
                head,
                applied: 0,
            });
        }
        let window = self
            .options
            .block_rate
            .saturating_mul(self.options.max_chunks_per_poll)
            .max(1);
        let to = from.saturating_add(window - 1).min(head);

        let mut events = self.loader.load(from, to, token).await?;
        sort_canonical(&mut events);
        let events = filter_unprocessed(events, cursor.latest_processed);

        let mut applied = 0;
        for raw in &events {
            if !token.is_live() {
                return Err(SyncError::Cancelled.into());
            }
            if self.apply_event(raw).await? == HandlerOutcome::Applied {
                applied += 1;
            }
        }

        let mut tx = self.storage.begin().await?;
        Storage::advance_complete(&mut tx, &self.partitions.cursor_keys(), to).await?;
        tx.commit().await.context("Failed to commit complete block")?;

        if !events.is_empty() {
            info!(
                "Synced blocks {} to {}: {} events, {} applied",
                from,
                to,
                events.len(),
                applied
            );
        }

        Ok(PollOutcome {
            complete: to == head,
            synced_to: to,
            head,
            applied,
        })
    }

    async fn apply_event(&self, raw: &RawEvent) -> Result<HandlerOutcome> {
        let event = self.decoder.decode(raw)?;
        let snapshot = self.partitions.snapshot();

        let mut tx = self.storage.begin().await?;
        let replayed = Storage::get_cursor(&mut tx, event.attester_id())
            .await?
            .is_some_and(|c| c.has_processed(raw.position()));
        let mut ctx = ApplyContext::new(&mut tx, raw, &snapshot);
        let outcome = if replayed {
            HandlerOutcome::Redundant
        } else {
            handlers::apply(&mut ctx, &event).await.with_context(|| {
                format!("Failed to apply {} at {}", event.kind(), raw.position())
            })?
        };
        let staged = std::mem::take(&mut ctx.staged);

        let mut keys = snapshot.cursor_keys().to_vec();
        keys.extend(staged.iter().map(|s| s.attester_id));
        Storage::advance_processed(&mut tx, &keys, raw.position()).await?;
        tx.commit().await.context("Failed to commit event")?;

        for s in staged {
            if self.partitions.register(s.attester_id, s.setting) {
                info!("Tracking attester {}", s.attester_id);
            }
        }

        debug!("{} at {}: {:?}", event.kind(), raw.position(), outcome);
        if outcome.is_notified() {
            self.notifier.emit(Notification::Event {
                kind: event.kind(),
                event,
                raw: raw.clone(),
                redundant: outcome == HandlerOutcome::Redundant,
            });
        }
        self.notifier
            .emit(Notification::ProcessedEvent(raw.clone()));

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttesterSelection;
    use crate::listener::EventKind;
    use crate::subgraph::SubgraphSynchronizer;
    use crate::testing::{id, History, MemoryPages, MemorySource};
    use alloy::primitives::Address;
    use std::time::Duration;
    use crate::rebuild::TreeRebuilder;
    use alloy::primitives::B256;
    use unisync_core::{EventPosition, DEFAULT_HISTORY_TREE_LEAF, DEFAULT_STATE_TREE_LEAF, U256};
    use unisync_imt::IncrementalMerkleTree;

    fn options(attesters: AttesterSelection) -> SyncOptions {
        SyncOptions {
            attesters,
            start_block: 0,
            poll_interval: Duration::from_millis(10),
            block_rate: 3,
            max_chunks_per_poll: 2,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(8),
            wait_interval: Duration::from_millis(5),
        }
    }

    fn only(ids: &[u64]) -> AttesterSelection {
        AttesterSelection::Only(ids.iter().map(|i| id(*i)).collect())
    }

    async fn synchronizer(
        source: &Arc<MemorySource>,
        storage: Storage,
        selection: AttesterSelection,
    ) -> Synchronizer {
        let sync = Synchronizer::new(source.clone(), storage, options(selection)).unwrap();
        sync.setup().await.unwrap();
        sync
    }

    async fn poll_until_complete<H: TreeHasher + 'static>(sync: &Synchronizer<H>) {
        for _ in 0..100 {
            if sync.poll().await.unwrap().complete {
                return;
            }
        }
        panic!("poll never completed");
    }

    fn source() -> Arc<MemorySource> {
        Arc::new(MemorySource::new(Address::repeat_byte(0x11)))
    }

    #[tokio::test]
    async fn test_example_scenario() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 1000, 10_000);
        source.push_user_signed_up(2, 0, 1, 0, 555, 0);
        source.push_state_tree_leaf(2, 0, 1, 0, 0, U256::from(4242));
        source.push_attestation(3, 0, 1, 0, 77, 1, 138);
        source.push_epoch_tree_leaf(4, 0, 1, 0, 0, U256::from(99));
        source.push_epoch_ended(5, 0, 1, 0);

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;
        poll_until_complete(&sync).await;

        let leaves = storage.state_tree_leaf_records(id(1), 0).await.unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].index, 0);

        let attestations = storage.attestations(id(1), 0).await.unwrap();
        assert_eq!(attestations.len(), 1);
        assert_eq!(attestations[0].field_index, 1);
        assert_eq!(attestations[0].change, U256::from(138));

        let epochs = storage.list_epochs(id(1)).await.unwrap();
        assert_eq!(epochs.len(), 2);
        assert!(epochs[0].number == 0 && epochs[0].sealed);
        assert!(epochs[1].number == 1 && !epochs[1].sealed);

        let epoch_tree = sync.gen_epoch_tree(0, None).await.unwrap();
        let mut expected = IncrementalMerkleTree::new(6, U256::ZERO).unwrap();
        expected.insert(U256::from(99)).unwrap();
        assert_eq!(epoch_tree.root(), expected.root());

        source.set_epoch_root(1, 0, expected.root());
        assert!(sync
            .epoch_tree_root_exists(epoch_tree.root(), 0, None)
            .await
            .unwrap());
        assert_eq!(sync.read_current_epoch(None).await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        source.push_user_signed_up(2, 0, 1, 0, 1, 0);
        source.push_state_tree_leaf(2, 0, 1, 0, 0, U256::from(5));
        source.push_attestation(3, 0, 1, 0, 9, 0, 1);
        source.push_user_state_transitioned(4, 0, 1, 0, 1, 42);
        source.push_history_tree_leaf(5, 0, 1, U256::from(8));
        source.push_epoch_ended(5, 0, 1, 0);

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;
        poll_until_complete(&sync).await;

        let stats = storage.stats().await.unwrap();
        let cursors = storage.list_cursors().await.unwrap();

        let all = source
            .query_filter(
                &EventDecoder::new().unwrap().filter(source.address()),
                0,
                10,
            )
            .await
            .unwrap();
        for raw in &all {
            let outcome = sync.inner.apply_event(raw).await.unwrap();
            assert_ne!(outcome, HandlerOutcome::Applied, "{:?}", raw.position());
        }

        assert_eq!(storage.stats().await.unwrap(), stats);
        assert_eq!(storage.list_cursors().await.unwrap(), cursors);
    }

    #[tokio::test]
    async fn test_ordering_across_chunks() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        for i in 0..12u64 {
            // Two leaves per block in separate transactions
            let block = 2 + i / 2;
            source.push_state_tree_leaf(block, i % 2, 1, 0, i, U256::from(1000 + i));
            source.push_history_tree_leaf(block, i % 2, 1, U256::from(2000 + i));
        }

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;
        poll_until_complete(&sync).await;

        let leaves = storage.state_tree_leaf_records(id(1), 0).await.unwrap();
        let indices: Vec<u64> = leaves.iter().map(|l| l.index).collect();
        assert_eq!(indices, (0..12).collect::<Vec<_>>());

        let history = storage.history_tree_leaves(id(1)).await.unwrap();
        let values: Vec<U256> = history.iter().map(|h| h.leaf).collect();
        let expected: Vec<U256> = (0..12u64).map(|i| U256::from(2000 + i)).collect();
        assert_eq!(values, expected);
        assert_eq!(
            history.iter().map(|h| h.index).collect::<Vec<_>>(),
            (0..12).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_epoch_mismatch_holds_cursor() {
        let source = source();
        let registration = source.push_attester_signed_up(1, 0, 1, 100, 0);
        let good = source.push_attestation(2, 0, 1, 0, 9, 0, 1);
        source.push_attestation(3, 0, 1, 5, 9, 0, 1);
        source.push_epoch_ended(4, 0, 1, 0);

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;

        for _ in 0..2 {
            let err = sync.poll().await.unwrap_err();
            assert!(matches!(
                classify(&err),
                Some(SyncError::EpochMismatch { epoch: 5, current: 0, .. })
            ));

            let cursor = storage.lowest_cursor(&[id(1)]).await.unwrap().unwrap();
            assert_eq!(cursor.latest_processed, Some(good.position()));
            assert_eq!(cursor.latest_complete_block, Some(registration.block_number - 1));
            assert_eq!(storage.stats().await.unwrap().attestation_count, 1);
            assert!(!storage.read_latest_epoch(id(1)).await.unwrap().sealed);
        }
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        source.push_state_tree_leaf(2, 0, 1, 0, 0, U256::from(1));
        source.push_state_tree_leaf(3, 0, 1, 0, 1, U256::from(2));

        {
            let storage = Storage::new_with_path(file.path()).await.unwrap();
            storage.run_migrations().await.unwrap();
            let sync = synchronizer(&source, storage.clone(), only(&[1])).await;
            poll_until_complete(&sync).await;
            storage.close().await;
        }

        source.push_state_tree_leaf(4, 0, 1, 0, 2, U256::from(3));
        source.push_epoch_ended(5, 0, 1, 0);

        let storage = Storage::new_with_path(file.path()).await.unwrap();
        storage.run_migrations().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;

        poll_until_complete(&sync).await;

        let leaves = storage.state_tree_leaf_records(id(1), 0).await.unwrap();
        assert_eq!(leaves.len(), 3);
        assert_eq!(sync.num_state_tree_leaves(0, None).await.unwrap(), 3);
        let cursor = storage.lowest_cursor(&[id(1)]).await.unwrap().unwrap();
        assert_eq!(cursor.latest_complete_block, Some(5));
        assert_eq!(cursor.latest_processed, Some(EventPosition::new(5, 0, 0)));
    }

    #[tokio::test]
    async fn test_track_all_registers_new_attesters() {
        let source = source();
        source.push_attester_signed_up(1, 0, 0, 1, 0);
        source.push_attester_signed_up(3, 0, 5, 100, 50);
        source.push_user_signed_up(4, 0, 5, 0, 11, 0);

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), AttesterSelection::All).await;
        assert_eq!(sync.partitions().tracked(), vec![id(5)]);
        poll_until_complete(&sync).await;

        source.push_attester_signed_up(10, 0, 6, 200, 60);
        source.push_user_signed_up(11, 0, 6, 0, 12, 0);
        poll_until_complete(&sync).await;

        assert_eq!(sync.partitions().tracked(), vec![id(5), id(6)]);
        let attesters = storage.list_attesters().await.unwrap();
        assert_eq!(attesters.len(), 2);
        assert_eq!(storage.user_signups(id(6)).await.unwrap().len(), 1);
        assert!(storage.list_attesters().await.unwrap().iter().all(|a| !a.attester_id.is_genesis()));

        let cursor = storage.lowest_cursor(&[id(6)]).await.unwrap().unwrap();
        assert_eq!(cursor.latest_complete_block, Some(11));
    }

    #[tokio::test]
    async fn test_setup_without_genesis() {
        let source = source();
        source.push_attester_signed_up(1, 0, 2, 100, 0);
        source.set_head(5);

        let storage = Storage::in_memory().await.unwrap();
        let sync = Synchronizer::new(source.clone(), storage, options(only(&[1]))).unwrap();
        let err = sync.setup().await.unwrap_err();
        assert_eq!(classify(&err), Some(&SyncError::GenesisNotFound));
        assert!(!sync.is_set_up());

        let err = sync.poll().await.unwrap_err();
        assert_eq!(classify(&err), Some(&SyncError::NotSetUp));
    }

    #[tokio::test]
    async fn test_start_wait_stop() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        for block in 2..20u64 {
            source.push_state_tree_leaf(block, 0, 1, 0, block - 2, U256::from(block));
        }
        source.fail_next_queries(2);

        let storage = Storage::in_memory().await.unwrap();
        let sync = Synchronizer::new(source.clone(), storage.clone(), options(only(&[1]))).unwrap();
        let handle = sync.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), sync.wait_for_sync(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(storage.count_state_tree_leaves(id(1), 0).await.unwrap(), 18);

        let mut phase = sync.subscribe_phase();
        tokio::time::timeout(
            Duration::from_secs(10),
            phase.wait_for(|p| *p == SyncPhase::SteadyState),
        )
        .await
        .unwrap()
        .unwrap();

        let ended = sync.notifier().once_event(EventKind::EpochEnded);
        source.push_epoch_ended(25, 0, 1, 0);
        let notification = tokio::time::timeout(Duration::from_secs(10), ended)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            notification,
            Notification::Event { redundant: false, .. }
        ));
        tokio::time::timeout(Duration::from_secs(10), sync.wait_for_sync(Some(25)))
            .await
            .unwrap()
            .unwrap();

        sync.stop();
        assert_eq!(sync.phase(), SyncPhase::Stopped);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_api() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        source.push_attester_signed_up(2, 0, 2, 50, 0);
        source.set_current_epoch(2, 7);
        source.use_nullifier(U256::from(3));
        source.add_state_root(1, 0, U256::from(44));

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage, only(&[1, 2])).await;

        assert_eq!(sync.attester_id().unwrap(), id(1));
        sync.set_attester_id(id(2)).unwrap();
        assert_eq!(sync.attester_id().unwrap(), id(2));
        assert!(sync.set_attester_id(id(3)).is_err());
        assert!(sync.check_attester_id(id(1)).is_ok());

        assert_eq!(sync.load_current_epoch(None).await.unwrap(), 7);
        assert!(sync.calc_current_epoch(None).unwrap() > 0);
        assert!(sync.calc_epoch_remaining_time(Some(id(1))).unwrap() <= 100);
        assert!(sync.nullifier_exist(U256::from(3)).await.unwrap());
        assert!(!sync.nullifier_exist(U256::from(4)).await.unwrap());
        assert!(sync
            .state_tree_root_exists(U256::from(44), 0, Some(id(1)))
            .await
            .unwrap());
        assert_eq!(sync.protocol_settings().unwrap(), source.settings_value());

        let err = sync.read_current_epoch(Some(id(9))).await.unwrap_err();
        assert_eq!(
            classify(&err),
            Some(&SyncError::AttesterNotSynchronized(id(9)))
        );
    }

    #[tokio::test]
    async fn test_cross_adapter_equivalence() {
        let source = source();
        let pages = MemoryPages::new();
        let history = History {
            source: &source,
            pages: &pages,
        };

        history.attester_signed_up(1, 1, 300, 1_000);
        history.attester_signed_up(2, 2, 300, 1_000);
        history.user_signed_up(3, 1, 0, 100, 0);
        history.user_signed_up(3, 1, 0, 101, 1);
        history.user_signed_up(4, 2, 0, 200, 0);
        history.attestation(5, 1, 0, 7, 1, 138);
        history.attestation(5, 1, unisync_core::MAX_EPOCH, 8, 0, 3);
        history.epoch_tree_leaf(6, 1, 0, 0, 333);
        history.epoch_tree_leaf(6, 1, 0, 1, 334);
        history.epoch_ended(7, 1, 0, 4444);
        history.user_state_transitioned(8, 1, 1, 55);
        history.user_signed_up(9, 1, 1, 102, 0);

        let live_store = Storage::in_memory().await.unwrap();
        let live = synchronizer(&source, live_store.clone(), only(&[1])).await;
        poll_until_complete(&live).await;

        let paged_store = Storage::in_memory().await.unwrap();
        let paged = SubgraphSynchronizer::new(
            Arc::new(pages),
            paged_store.clone(),
            &only(&[1]),
            source.settings_value(),
            2,
        );
        let summary = paged.save(Some(id(1))).await.unwrap();
        assert!(summary.applied > 0);

        for epoch in 0..2 {
            assert_eq!(
                live.gen_state_tree(epoch, None).await.unwrap().root(),
                paged.gen_state_tree(epoch, None).await.unwrap().root()
            );
            assert_eq!(
                live.gen_epoch_tree(epoch, None).await.unwrap().root(),
                paged.gen_epoch_tree(epoch, None).await.unwrap().root()
            );
            assert_eq!(
                live_store.attestations(id(1), epoch).await.unwrap(),
                paged_store.attestations(id(1), epoch).await.unwrap()
            );
        }
        assert_eq!(
            live.gen_history_tree(None).await.unwrap().root(),
            paged.gen_history_tree(None).await.unwrap().root()
        );
        assert_eq!(
            live_store.list_epochs(id(1)).await.unwrap(),
            paged_store.list_epochs(id(1)).await.unwrap()
        );
        assert_eq!(
            live_store.list_attesters().await.unwrap(),
            paged_store.list_attesters().await.unwrap()
        );
        assert_eq!(
            live_store.user_signups(id(1)).await.unwrap(),
            paged_store.user_signups(id(1)).await.unwrap()
        );
        assert_eq!(
            live_store.get_nullifier(U256::from(55)).await.unwrap(),
            paged_store.get_nullifier(U256::from(55)).await.unwrap()
        );
        assert_eq!(paged.load_current_epoch(None).await.unwrap(), 1);
        assert_eq!(paged.read_current_epoch(None).await.unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_equal_history_leaves_are_kept() {
        let source = source();
        let pages = MemoryPages::new();
        let history = History {
            source: &source,
            pages: &pages,
        };

        history.attester_signed_up(1, 1, 300, 1_000);
        // Two empty epochs end with the same history leaf
        history.epoch_ended(2, 1, 0, 8);
        history.epoch_ended(3, 1, 1, 8);

        let live_store = Storage::in_memory().await.unwrap();
        let live = synchronizer(&source, live_store.clone(), only(&[1])).await;
        poll_until_complete(&live).await;

        let rows = live_store.history_tree_leaves(id(1)).await.unwrap();
        assert_eq!(
            rows.iter().map(|h| (h.index, h.leaf)).collect::<Vec<_>>(),
            vec![(0, U256::from(8)), (1, U256::from(8))]
        );

        let mut expected = IncrementalMerkleTree::new(8, DEFAULT_HISTORY_TREE_LEAF).unwrap();
        expected.insert(U256::from(8)).unwrap();
        expected.insert(U256::from(8)).unwrap();
        assert_eq!(live.gen_history_tree(None).await.unwrap().root(), expected.root());

        // Polling again after completion leaves the rows alone
        poll_until_complete(&live).await;
        assert_eq!(live_store.history_tree_leaves(id(1)).await.unwrap().len(), 2);

        let paged_store = Storage::in_memory().await.unwrap();
        let paged = SubgraphSynchronizer::new(
            Arc::new(pages),
            paged_store.clone(),
            &only(&[1]),
            source.settings_value(),
            1,
        );
        paged.save(Some(id(1))).await.unwrap();
        paged.save(Some(id(1))).await.unwrap();
        assert_eq!(paged_store.history_tree_leaves(id(1)).await.unwrap(), rows);
        assert_eq!(paged.gen_history_tree(None).await.unwrap().root(), expected.root());
    }

    #[tokio::test]
    async fn test_unrecognized_topic_stops_processing() {
        let source = source();
        let registration = source.push_attester_signed_up(1, 0, 1, 100, 0);
        let good = source.push_attestation(2, 0, 1, 0, 9, 0, 1);
        source.push_unknown_log(3, 0);
        source.push_attestation(4, 0, 1, 0, 10, 0, 1);

        let storage = Storage::in_memory().await.unwrap();
        let sync = synchronizer(&source, storage.clone(), only(&[1])).await;
        source.ignore_topic_filter();

        for _ in 0..2 {
            let err = sync.poll().await.unwrap_err();
            assert_eq!(
                classify(&err),
                Some(&SyncError::UnrecognizedTopic(B256::repeat_byte(0xee)))
            );

            let cursor = storage.lowest_cursor(&[id(1)]).await.unwrap().unwrap();
            assert_eq!(cursor.latest_processed, Some(good.position()));
            assert_eq!(cursor.latest_complete_block, Some(registration.block_number - 1));
            assert_eq!(storage.stats().await.unwrap().attestation_count, 1);
        }
    }

    #[derive(Debug, Clone, Copy)]
    struct LinearHasher;

    impl TreeHasher for LinearHasher {
        fn hash_pair(&self, left: &Field, right: &Field) -> Field {
            left.wrapping_mul(U256::from(3)).wrapping_add(*right)
        }
    }

    #[tokio::test]
    async fn test_read_api_uses_injected_hasher() {
        let source = source();
        source.push_attester_signed_up(1, 0, 1, 100, 0);
        source.push_state_tree_leaf(2, 0, 1, 0, 0, U256::from(5));
        source.push_state_tree_leaf(2, 1, 1, 0, 1, U256::from(6));
        source.push_epoch_tree_leaf(3, 0, 1, 0, 0, U256::from(7));

        let storage = Storage::in_memory().await.unwrap();
        let sync = Synchronizer::with_hasher(
            source.clone(),
            storage.clone(),
            options(only(&[1])),
            LinearHasher,
        )
        .unwrap();
        sync.setup().await.unwrap();
        poll_until_complete(&sync).await;

        let mut expected =
            IncrementalMerkleTree::with_hasher(8, DEFAULT_STATE_TREE_LEAF, LinearHasher).unwrap();
        expected.insert(U256::from(5)).unwrap();
        expected.insert(U256::from(6)).unwrap();

        let state_tree = sync.gen_state_tree(0, None).await.unwrap();
        assert_eq!(state_tree.root(), expected.root());
        let keccak = TreeRebuilder::new(storage.clone(), source.settings_value())
            .state_tree(id(1), 0)
            .await
            .unwrap();
        assert_ne!(state_tree.root(), keccak.root());

        let proof = sync.epoch_tree_proof(0, 0, None).await.unwrap();
        assert!(proof.verify(&LinearHasher));
        assert!(!proof.verify(&Keccak256Hasher));

        let paged = SubgraphSynchronizer::with_hasher(
            Arc::new(MemoryPages::new()),
            storage,
            &only(&[1]),
            source.settings_value(),
            10,
            LinearHasher,
        );
        assert_eq!(paged.gen_state_tree(0, None).await.unwrap().root(), expected.root());
    }
}
