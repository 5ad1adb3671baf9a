//! In-memory collaborators
//!
//! Small, self-contained implementations of the chain, pool, downloader,
//! fetcher and consensus contracts. They back the `simulate` command and
//! the test suites; they make no attempt at persistence or real retrieval.

use crate::consensus::{ConsensusEngine, ConsensusError, ConsensusHandler, ConsensusPacket, NoopEngine};
use crate::core::{Block, Chain, ChainError, Header, NewTxsEvent, PoolError, Transaction, TxPool};
use crate::crypto::Hash;
use crate::network::{BlockAnnouncement, Peer, PeerId, SnapPacket};
use crate::sync::{
    BlockFetcher, BlockFetcherHooks, ChainDownloader, DownloaderError, DownloaderHooks,
    FetcherError, ImportOutcome, SyncMode, SyncOp, TxFetcher, TxFetcherHooks,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Pool event channel capacity
const POOL_EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Chain
// =============================================================================

#[derive(Debug)]
struct ChainInner {
    blocks: HashMap<Hash, Block>,
    td: HashMap<Hash, u128>,
    /// Canonical hashes indexed by height
    canonical: Vec<Hash>,
    fast_height: u64,
}

/// Chain held entirely in memory, heaviest chain wins
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
    genesis: Hash,
    forks: Vec<u64>,
    engine: Arc<dyn ConsensusEngine>,
}

impl MemoryChain {
    pub fn new(network_id: u64) -> Self {
        Self::with_forks(network_id, Vec::new())
    }

    /// Create a chain with scheduled protocol upgrade heights
    pub fn with_forks(network_id: u64, forks: Vec<u64>) -> Self {
        let genesis = Block::genesis(network_id);
        let hash = genesis.hash;
        let td = genesis.difficulty();
        let inner = ChainInner {
            blocks: HashMap::from([(hash, genesis)]),
            td: HashMap::from([(hash, td)]),
            canonical: vec![hash],
            fast_height: 0,
        };
        Self {
            inner: RwLock::new(inner),
            genesis: hash,
            forks,
            engine: Arc::new(NoopEngine::default()),
        }
    }

    /// Pretend a fast sync reached the given height
    pub fn set_fast_height(&self, height: u64) {
        self.inner.write().fast_height = height;
    }

    /// Build and insert `count` blocks on top of the current head
    pub fn extend(&self, count: u64, difficulty: u128) -> Result<Vec<Block>, ChainError> {
        let blocks = build_chain(&self.current_block(), count, difficulty, &[]);
        self.insert_chain(blocks.clone())?;
        Ok(blocks)
    }

    fn reorg(inner: &mut ChainInner, head: Hash) {
        let mut hashes = Vec::new();
        let mut cursor = Some(head);
        while let Some(hash) = cursor {
            let Some(block) = inner.blocks.get(&hash) else {
                break;
            };
            hashes.push(hash);
            cursor = (block.number() > 0).then(|| block.parent_hash());
        }
        hashes.reverse();
        inner.canonical = hashes;
    }
}

/// Build `count` linked blocks on top of `parent` without inserting them
pub fn build_chain(parent: &Block, count: u64, difficulty: u128, txs: &[Transaction]) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(count as usize);
    let mut parent_hash = parent.hash;
    for number in parent.number() + 1..=parent.number() + count {
        let block = Block::new(Header::new(parent_hash, number, difficulty), txs.to_vec());
        parent_hash = block.hash;
        blocks.push(block);
    }
    blocks
}

impl Chain for MemoryChain {
    fn current_block(&self) -> Block {
        let inner = self.inner.read();
        let head = inner.canonical.last().copied().unwrap_or(self.genesis);
        inner
            .blocks
            .get(&head)
            .cloned()
            .unwrap_or_else(|| Block::genesis(0))
    }

    fn current_fast_height(&self) -> u64 {
        self.inner.read().fast_height
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.inner.read().blocks.get(hash).cloned()
    }

    fn block_by_number(&self, number: u64) -> Option<Block> {
        let inner = self.inner.read();
        let hash = inner.canonical.get(number as usize)?;
        inner.blocks.get(hash).cloned()
    }

    fn header(&self, hash: &Hash, number: u64) -> Option<Header> {
        self.block_by_hash(hash)
            .filter(|b| b.number() == number)
            .map(|b| b.header)
    }

    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<u128> {
        let inner = self.inner.read();
        inner
            .blocks
            .get(hash)
            .filter(|b| b.number() == number)
            .and_then(|_| inner.td.get(hash).copied())
    }

    fn has_block(&self, hash: &Hash, number: u64) -> bool {
        self.header(hash, number).is_some()
    }

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError> {
        let mut inner = self.inner.write();
        let mut imported = 0;

        for (index, block) in blocks.into_iter().enumerate() {
            let Some(number) = block.header.number else {
                return Err(ChainError::InvalidBlock {
                    index,
                    reason: "missing number".into(),
                });
            };
            if inner.blocks.contains_key(&block.hash) {
                continue;
            }
            let parent = block.parent_hash();
            let (parent_number, parent_td) = match (inner.blocks.get(&parent), inner.td.get(&parent)) {
                (Some(p), Some(td)) => (p.number(), *td),
                _ => return Err(ChainError::UnknownParent { number, parent }),
            };
            if number != parent_number + 1 {
                return Err(ChainError::InvalidBlock {
                    index,
                    reason: format!("number {} does not follow parent {}", number, parent_number),
                });
            }
            if let Err(e) = self.engine.verify_header(&block.header) {
                return Err(ChainError::InvalidBlock {
                    index,
                    reason: e.to_string(),
                });
            }

            let hash = block.hash;
            let td = parent_td + block.difficulty();
            inner.blocks.insert(hash, block);
            inner.td.insert(hash, td);
            imported += 1;

            let head_td = inner
                .canonical
                .last()
                .and_then(|h| inner.td.get(h).copied())
                .unwrap_or_default();
            if td > head_td {
                Self::reorg(&mut inner, hash);
            }
        }

        if imported > 0 {
            log::debug!(
                "Imported {} block(s), head now {}",
                imported,
                inner.canonical.len().saturating_sub(1)
            );
        }
        Ok(imported)
    }

    fn engine(&self) -> Arc<dyn ConsensusEngine> {
        self.engine.clone()
    }

    fn fork_blocks(&self) -> Vec<u64> {
        self.forks.clone()
    }

    fn genesis_hash(&self) -> Hash {
        self.genesis
    }
}

// =============================================================================
// Transaction Pool
// =============================================================================

/// Unordered pool with tip-based admission
pub struct MemoryTxPool {
    txs: RwLock<HashMap<Hash, Transaction>>,
    min_tip: u64,
    feed: broadcast::Sender<NewTxsEvent>,
}

impl MemoryTxPool {
    pub fn new() -> Self {
        Self::with_min_tip(0)
    }

    pub fn with_min_tip(min_tip: u64) -> Self {
        let (feed, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        Self {
            txs: RwLock::new(HashMap::new()),
            min_tip,
            feed,
        }
    }

    /// Add locally submitted transactions
    pub fn add_locals(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>> {
        self.add(txs)
    }

    pub fn len(&self) -> usize {
        self.txs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn add(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>> {
        let mut accepted = Vec::new();
        let results = {
            let mut pool = self.txs.write();
            txs.into_iter()
                .map(|tx| {
                    let hash = tx.hash();
                    if pool.contains_key(&hash) {
                        return Err(PoolError::AlreadyKnown);
                    }
                    if tx.tip < self.min_tip {
                        return Err(PoolError::Underpriced(tx.tip));
                    }
                    pool.insert(hash, tx.clone());
                    accepted.push(tx);
                    Ok(())
                })
                .collect()
        };

        if !accepted.is_empty() {
            // No subscribers is fine
            let _ = self.feed.send(NewTxsEvent { txs: accepted });
        }
        results
    }
}

impl Default for MemoryTxPool {
    fn default() -> Self {
        Self::new()
    }
}

impl TxPool for MemoryTxPool {
    fn has(&self, hash: &Hash) -> bool {
        self.txs.read().contains_key(hash)
    }

    fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.txs.read().get(hash).cloned()
    }

    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>> {
        self.add(txs)
    }

    fn pending(&self, enforce_tips: bool) -> BTreeMap<String, Vec<Transaction>> {
        let mut pending: BTreeMap<String, Vec<Transaction>> = BTreeMap::new();
        for tx in self.txs.read().values() {
            if enforce_tips && tx.tip < self.min_tip {
                continue;
            }
            pending.entry(tx.sender.clone()).or_default().push(tx.clone());
        }
        for txs in pending.values_mut() {
            txs.sort_by_key(|tx| tx.nonce);
        }
        pending
    }

    fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent> {
        self.feed.subscribe()
    }
}

// =============================================================================
// Downloader
// =============================================================================

#[derive(Default)]
struct DownloaderState {
    hooks: Option<DownloaderHooks>,
    peers: BTreeSet<PeerId>,
    banned: HashSet<PeerId>,
    unregistered: Vec<PeerId>,
    syncs: Vec<SyncOp>,
    import: Option<(Vec<Block>, Arc<MemoryChain>)>,
    fail_next: bool,
    headers: Vec<(PeerId, Vec<Header>)>,
    snap_packets: Vec<(PeerId, SnapPacket)>,
}

/// Downloader that records calls and imports a preset batch on sync
#[derive(Default)]
pub struct IdleDownloader {
    state: Mutex<DownloaderState>,
}

impl IdleDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the peer on registration
    pub fn ban(&self, id: impl Into<PeerId>) {
        self.state.lock().banned.insert(id.into());
    }

    /// Blocks the next successful sync inserts into `chain`
    pub fn set_import(&self, blocks: Vec<Block>, chain: Arc<MemoryChain>) {
        self.state.lock().import = Some((blocks, chain));
    }

    pub fn fail_next_sync(&self) {
        self.state.lock().fail_next = true;
    }

    pub fn sync_calls(&self) -> Vec<SyncOp> {
        self.state.lock().syncs.clone()
    }

    pub fn registered_peers(&self) -> Vec<PeerId> {
        self.state.lock().peers.iter().cloned().collect()
    }

    pub fn unregistered_peers(&self) -> Vec<PeerId> {
        self.state.lock().unregistered.clone()
    }

    pub fn delivered_headers(&self) -> Vec<(PeerId, Vec<Header>)> {
        self.state.lock().headers.clone()
    }

    pub fn snap_packets(&self) -> Vec<(PeerId, SnapPacket)> {
        self.state.lock().snap_packets.clone()
    }

    pub fn hooks(&self) -> Option<DownloaderHooks> {
        self.state.lock().hooks.clone()
    }
}

#[async_trait]
impl ChainDownloader for IdleDownloader {
    fn install(&self, hooks: DownloaderHooks) {
        self.state.lock().hooks = Some(hooks);
    }

    fn register_peer(&self, peer: Arc<Peer>) -> Result<(), DownloaderError> {
        let mut state = self.state.lock();
        if state.banned.contains(peer.id()) {
            return Err(DownloaderError::Banned(peer.id().clone()));
        }
        state.peers.insert(peer.id().clone());
        Ok(())
    }

    fn unregister_peer(&self, id: &PeerId) -> Result<(), DownloaderError> {
        let mut state = self.state.lock();
        state.unregistered.push(id.clone());
        if !state.peers.remove(id) {
            return Err(DownloaderError::UnknownPeer(id.clone()));
        }
        Ok(())
    }

    async fn synchronise(
        &self,
        id: &PeerId,
        head: Hash,
        td: u128,
        mode: SyncMode,
    ) -> Result<(), DownloaderError> {
        let import = {
            let mut state = self.state.lock();
            state.syncs.push(SyncOp {
                peer: id.clone(),
                head,
                td,
                mode,
            });
            if std::mem::take(&mut state.fail_next) {
                return Err(DownloaderError::Failed("injected failure".into()));
            }
            state.import.take()
        };

        if let Some((blocks, chain)) = import {
            chain
                .insert_chain(blocks)
                .map_err(|e| DownloaderError::Failed(e.to_string()))?;
        }
        Ok(())
    }

    fn deliver_headers(&self, id: &PeerId, headers: Vec<Header>) -> Result<(), DownloaderError> {
        self.state.lock().headers.push((id.clone(), headers));
        Ok(())
    }

    fn deliver_snap_packet(&self, id: &PeerId, packet: SnapPacket) -> Result<(), DownloaderError> {
        self.state.lock().snap_packets.push((id.clone(), packet));
        Ok(())
    }
}

// =============================================================================
// Fetchers
// =============================================================================

/// Block fetcher that verifies and imports propagated blocks immediately
#[derive(Default)]
pub struct InlineBlockFetcher {
    hooks: Mutex<Option<BlockFetcherHooks>>,
    announced: Mutex<Vec<(PeerId, BlockAnnouncement)>>,
    outcomes: Mutex<Vec<ImportOutcome>>,
}

impl InlineBlockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announcements(&self) -> Vec<(PeerId, BlockAnnouncement)> {
        self.announced.lock().clone()
    }

    pub fn outcomes(&self) -> Vec<ImportOutcome> {
        self.outcomes.lock().clone()
    }

    pub fn hooks(&self) -> Option<BlockFetcherHooks> {
        self.hooks.lock().clone()
    }
}

impl BlockFetcher for InlineBlockFetcher {
    fn install(&self, hooks: BlockFetcherHooks) {
        *self.hooks.lock() = Some(hooks);
    }

    fn notify(&self, peer: &PeerId, announcement: BlockAnnouncement) -> Result<(), FetcherError> {
        self.announced.lock().push((peer.clone(), announcement));
        Ok(())
    }

    fn enqueue(&self, peer: &PeerId, block: Block) -> Result<(), FetcherError> {
        let hooks = self.hooks().ok_or(FetcherError::Terminated)?;

        if let Err(e) = (hooks.verify_header)(&block.header) {
            log::debug!("Propagated block {} from {} failed verification: {}", block.hash.short(), peer, e);
            (hooks.drop_peer)(peer);
            return Ok(());
        }
        (hooks.broadcast_block)(&block, true);

        match (hooks.insert_chain)(vec![block.clone()]) {
            Ok(outcome) => {
                if let ImportOutcome::Imported(n) = outcome {
                    if n > 0 {
                        (hooks.broadcast_block)(&block, false);
                    }
                }
                self.outcomes.lock().push(outcome);
            }
            Err(e) => log::debug!("Propagated block {} import failed: {}", block.hash.short(), e),
        }
        Ok(())
    }
}

/// Transaction fetcher that requests every unknown announced hash at once
#[derive(Default)]
pub struct InlineTxFetcher {
    hooks: Mutex<Option<TxFetcherHooks>>,
    requested: Mutex<Vec<(PeerId, Vec<Hash>)>>,
    dropped: Mutex<Vec<PeerId>>,
}

impl InlineTxFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Vec<(PeerId, Vec<Hash>)> {
        self.requested.lock().clone()
    }

    pub fn dropped(&self) -> Vec<PeerId> {
        self.dropped.lock().clone()
    }

    pub fn hooks(&self) -> Option<TxFetcherHooks> {
        self.hooks.lock().clone()
    }
}

impl TxFetcher for InlineTxFetcher {
    fn install(&self, hooks: TxFetcherHooks) {
        *self.hooks.lock() = Some(hooks);
    }

    fn notify(&self, peer: &PeerId, hashes: Vec<Hash>) -> Result<(), FetcherError> {
        let hooks = self.hooks().ok_or(FetcherError::Terminated)?;
        let unknown: Vec<Hash> = hashes.into_iter().filter(|h| !(hooks.has)(h)).collect();
        if unknown.is_empty() {
            return Ok(());
        }
        self.requested.lock().push((peer.clone(), unknown.clone()));
        (hooks.fetch)(peer, unknown)
    }

    fn enqueue(&self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) -> Result<(), FetcherError> {
        let hooks = self.hooks().ok_or(FetcherError::Terminated)?;
        let count = txs.len();
        let added = (hooks.add)(txs).iter().filter(|r| r.is_ok()).count();
        log::trace!(
            "Added {}/{} {} transaction(s) from {}",
            added,
            count,
            if direct { "pushed" } else { "requested" },
            peer
        );
        Ok(())
    }

    fn drop_peer(&self, peer: &PeerId) {
        self.dropped.lock().push(peer.clone());
    }
}

// =============================================================================
// Consensus
// =============================================================================

/// Something the consensus relay target observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Packet(ConsensusPacket),
}

/// Consensus relay target that records what it receives
#[derive(Default)]
pub struct RecordingConsensus {
    events: Mutex<Vec<ConsensusEvent>>,
    replies: Mutex<Vec<ConsensusPacket>>,
    reject: AtomicBool,
}

impl RecordingConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets returned for every data request
    pub fn set_replies(&self, replies: Vec<ConsensusPacket>) {
        *self.replies.lock() = replies;
    }

    /// Reject every subsequent packet
    pub fn reject_packets(&self, reject: bool) {
        self.reject.store(reject, Ordering::Release);
    }

    pub fn events(&self) -> Vec<ConsensusEvent> {
        self.events.lock().clone()
    }
}

impl ConsensusHandler for RecordingConsensus {
    fn on_peer_connected(&self, peer: &PeerId) -> Result<(), ConsensusError> {
        self.events.lock().push(ConsensusEvent::Connected(peer.clone()));
        Ok(())
    }

    fn on_peer_disconnected(&self, peer: &PeerId) -> Result<(), ConsensusError> {
        self.events.lock().push(ConsensusEvent::Disconnected(peer.clone()));
        Ok(())
    }

    fn handle_consensus_packet(&self, packet: &ConsensusPacket) -> Result<(), ConsensusError> {
        if self.reject.load(Ordering::Acquire) {
            return Err(ConsensusError::Rejected(format!("packet code {}", packet.code)));
        }
        self.events.lock().push(ConsensusEvent::Packet(packet.clone()));
        Ok(())
    }

    fn handle_request_consensus_data(
        &self,
        _packet: &ConsensusPacket,
    ) -> Result<Vec<ConsensusPacket>, ConsensusError> {
        Ok(self.replies.lock().clone())
    }
}
