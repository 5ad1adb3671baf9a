//! Protocol handler
//!
//! Orchestrates peer admission, sync-mode selection, block/transaction
//! propagation, consensus packet relay and the lifecycle of the
//! background loops. One handler is built per node by the composition
//! root and shared by reference with everything that needs it.

mod admission;
mod loops;
mod messages;
pub mod snap;

pub use loops::TX_SYNC_PACK_SIZE;
pub use messages::{MAX_HEADERS_SERVE, MAX_TXS_SERVE};
pub use snap::{SnapHandler, SnapPeerInfo};

use crate::config::{ConfigError, HandlerSettings};
use crate::consensus::{ConsensusHandler, ConsensusPacket, RebroadcastFilter};
use crate::core::{Block, Chain, ChainError, EventMux, ForkFilter, Transaction, TxPool};
use crate::crypto::Hash;
use crate::network::{
    Broadcaster, HandshakeError, PeerError, PeerId, PeerInfo, PeerSet, RegistryError, Status,
};
use crate::sync::{
    BlockFetcher, BlockFetcherHooks, ChainDownloader, ChainSync, DeferReason, DownloaderError,
    DownloaderHooks, FetcherError, ImportOutcome, StateBloom, SyncMode, SyncState, TxFetcher,
    TxFetcherHooks,
};
use loops::{RelayEvent, TxSyncRequest};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Pending legacy transaction sync requests
const TX_SYNC_QUEUE: usize = 64;

/// Protocol handler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandlerError {
    #[error("Quitting")]
    Quitting,
    #[error("Too many peers")]
    TooManyPeers,
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Downloader error: {0}")]
    Downloader(#[from] DownloaderError),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(&'static str),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Checkpoint hash mismatch")]
    CheckpointMismatch,
    #[error("Whitelist block mismatch at {0}")]
    WhitelistMismatch(u64),
    #[error("Peer disconnected")]
    Disconnected,
}

impl From<ConfigError> for HandlerError {
    fn from(e: ConfigError) -> Self {
        HandlerError::InvalidConfig(e.to_string())
    }
}

/// Everything the handler is built from
pub struct HandlerConfig {
    pub settings: HandlerSettings,
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
    pub downloader: Arc<dyn ChainDownloader>,
    pub block_fetcher: Arc<dyn BlockFetcher>,
    pub tx_fetcher: Arc<dyn TxFetcher>,
    /// Relay target for consensus packets
    pub consensus: Arc<dyn ConsensusHandler>,
    /// Mined block events; a private multiplexer is created if absent
    pub event_mux: Option<EventMux>,
}

/// Summary of the local node for status endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub network_id: u64,
    pub difficulty: u128,
    pub genesis: Hash,
    pub head: Hash,
    pub sync_mode: SyncMode,
}

/// The protocol handler
pub struct Handler {
    network_id: u64,
    fork_filter: ForkFilter,
    state: Arc<SyncState>,
    /// Trusted checkpoint as (number, hash)
    checkpoint: Option<(u64, Hash)>,
    whitelist: BTreeMap<u64, Hash>,
    max_peers: AtomicUsize,
    rebroadcast: RebroadcastFilter,
    rebroadcast_fanout: usize,
    challenge_timeout: Duration,

    chain: Arc<dyn Chain>,
    tx_pool: Arc<dyn TxPool>,
    downloader: Arc<dyn ChainDownloader>,
    block_fetcher: Arc<dyn BlockFetcher>,
    tx_fetcher: Arc<dyn TxFetcher>,
    consensus: Arc<dyn ConsensusHandler>,
    event_mux: EventMux,

    peers: Arc<PeerSet>,
    broadcaster: Arc<Broadcaster>,
    chain_sync: Arc<ChainSync>,
    txsync_tx: mpsc::Sender<TxSyncRequest>,
    txsync_rx: Mutex<Option<mpsc::Receiver<TxSyncRequest>>>,

    /// Closing these ends the tx and mined-block subscriptions
    tx_sub: CancellationToken,
    mined_sub: CancellationToken,
    quit: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    peer_tasks: TaskTracker,
    snap: SnapHandler,

    /// Peer notifications for the consensus relay target, delivered in order
    relay_tx: mpsc::UnboundedSender<RelayEvent>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    relay_quit: CancellationToken,
    relay_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Handler {
    /// Build the handler and wire its hooks into the collaborators
    pub fn new(config: HandlerConfig) -> Result<Self, HandlerError> {
        let HandlerConfig {
            settings,
            chain,
            tx_pool,
            downloader,
            block_fetcher,
            tx_fetcher,
            consensus,
            event_mux,
        } = config;
        settings.validate()?;

        let event_mux = event_mux.unwrap_or_default();

        let full_height = chain.current_height();
        let fast_height = chain.current_fast_height();
        let mode = SyncMode::resolve(settings.sync_mode, full_height, fast_height);
        if mode != settings.sync_mode {
            log::warn!(
                "Switched sync mode from {} to {} (full height {}, fast height {})",
                settings.sync_mode,
                mode,
                full_height,
                fast_height
            );
        }
        let state = Arc::new(SyncState::new(mode));

        let checkpoint = settings.checkpoint.map(|cp| (cp.number(), cp.hash()));
        if let Some((number, hash)) = checkpoint {
            log::info!("Enforcing checkpoint {} ({})", number, hash.short());
        }

        let fork_filter = {
            let chain = chain.clone();
            ForkFilter::new(
                chain.genesis_hash(),
                &chain.fork_blocks(),
                Arc::new(move || chain.current_height()),
            )
        };

        let peers = Arc::new(PeerSet::new());
        let broadcaster = Arc::new(Broadcaster::new(peers.clone(), chain.clone()));
        let quit = CancellationToken::new();
        let chain_sync = Arc::new(ChainSync::new(
            chain.clone(),
            peers.clone(),
            downloader.clone(),
            state.clone(),
            broadcaster.clone(),
            checkpoint.map(|(number, _)| number).unwrap_or(0),
            quit.clone(),
        ));
        let (txsync_tx, txsync_rx) = mpsc::channel(TX_SYNC_QUEUE);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let snap = SnapHandler::new(peers.clone(), downloader.clone());

        let handler = Self {
            network_id: settings.network_id,
            fork_filter,
            state,
            checkpoint,
            whitelist: settings.whitelist.clone(),
            max_peers: AtomicUsize::new(0),
            rebroadcast: RebroadcastFilter::new(settings.rebroadcast_retention()),
            rebroadcast_fanout: settings.rebroadcast_fanout,
            challenge_timeout: settings.checkpoint_challenge_timeout(),
            chain,
            tx_pool,
            downloader,
            block_fetcher,
            tx_fetcher,
            consensus,
            event_mux,
            peers,
            broadcaster,
            chain_sync,
            txsync_tx,
            txsync_rx: Mutex::new(Some(txsync_rx)),
            tx_sub: CancellationToken::new(),
            mined_sub: CancellationToken::new(),
            quit,
            loops: Mutex::new(Vec::new()),
            peer_tasks: TaskTracker::new(),
            snap,
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
            relay_quit: CancellationToken::new(),
            relay_loop: Mutex::new(None),
        };
        handler.install_hooks(&settings);
        Ok(handler)
    }

    fn install_hooks(&self, settings: &HandlerSettings) {
        let height = {
            let chain = self.chain.clone();
            Arc::new(move || chain.current_height())
        };
        let drop_peer = {
            let peers = self.peers.clone();
            Arc::new(move |id: &PeerId| {
                if let Some(peer) = peers.get(id) {
                    log::debug!("Dropping peer {}", id);
                    peer.disconnect();
                }
            })
        };

        // Snap sync supersedes the fast-sync state bloom
        let state_bloom = match self.state.mode() {
            SyncMode::Fast => Some(Arc::new(StateBloom::with_budget(settings.bloom_cache_mb))),
            _ => None,
        };
        self.downloader.install(DownloaderHooks {
            height: height.clone(),
            drop_peer: drop_peer.clone(),
            state_bloom,
        });

        let verify_header = {
            let engine = self.chain.engine();
            Arc::new(move |header: &crate::core::Header| engine.verify_header(header))
        };
        let insert_chain = {
            let chain = self.chain.clone();
            let state = self.state.clone();
            let checkpoint = self.checkpoint.map(|(number, _)| number);
            Arc::new(move |blocks: Vec<Block>| {
                import_propagated(chain.as_ref(), &state, checkpoint, blocks)
            })
        };
        let broadcast_block = {
            let broadcaster = self.broadcaster.clone();
            Arc::new(move |block: &Block, propagate: bool| {
                broadcaster.broadcast_block(block, propagate)
            })
        };
        self.block_fetcher.install(BlockFetcherHooks {
            height,
            verify_header,
            insert_chain,
            broadcast_block,
            drop_peer,
        });

        let has = {
            let pool = self.tx_pool.clone();
            Arc::new(move |hash: &Hash| pool.has(hash))
        };
        let add = {
            let pool = self.tx_pool.clone();
            Arc::new(move |txs: Vec<Transaction>| pool.add_remotes(txs))
        };
        let fetch = {
            let peers = self.peers.clone();
            Arc::new(move |id: &PeerId, hashes: Vec<Hash>| -> Result<(), FetcherError> {
                let peer = peers
                    .get(id)
                    .ok_or_else(|| FetcherError::UnknownPeer(id.clone()))?;
                peer.request_transactions(hashes)?;
                Ok(())
            })
        };
        self.tx_fetcher.install(TxFetcherHooks { has, add, fetch });
    }

    /// Launch the background loops
    pub fn start(self: &Arc<Self>, max_peers: usize) {
        self.max_peers.store(max_peers, Ordering::Release);
        self.chain_sync.set_max_peers(max_peers);

        let mut loops = self.loops.lock();

        let txs = self.tx_pool.subscribe_new_txs();
        loops.push(tokio::spawn(self.clone().tx_broadcast_loop(txs)));

        let mined = self.event_mux.subscribe();
        loops.push(tokio::spawn(self.clone().mined_broadcast_loop(mined)));

        let chain_sync = self.chain_sync.clone();
        loops.push(tokio::spawn(async move { chain_sync.run().await }));

        if let Some(requests) = self.txsync_rx.lock().take() {
            loops.push(tokio::spawn(self.clone().tx_sync_loop(requests)));
        }

        // Outlives the other loops so peer teardown can still notify
        if let Some(events) = self.relay_rx.lock().take() {
            *self.relay_loop.lock() = Some(tokio::spawn(self.clone().relay_notify_loop(events)));
        }
        log::info!("Protocol handler started (max peers: {})", max_peers);
    }

    /// Stop the background loops and wait for every peer task to exit
    pub async fn stop(&self) {
        log::info!("Stopping protocol handler");

        // Quit broadcast loops before tearing down the registry they use
        self.tx_sub.cancel();
        self.mined_sub.cancel();
        self.quit.cancel();

        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                log::error!("Background loop failed: {}", e);
            }
        }

        self.peers.close();
        self.peer_tasks.close();
        self.peer_tasks.wait().await;

        self.relay_quit.cancel();
        let relay_loop = self.relay_loop.lock().take();
        if let Some(handle) = relay_loop {
            if let Err(e) = handle.await {
                log::error!("Consensus notification loop failed: {}", e);
            }
        }
        log::info!("Protocol handler stopped");
    }

    pub fn network_id(&self) -> u64 {
        self.network_id
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.load(Ordering::Acquire)
    }

    pub fn peers(&self) -> &Arc<PeerSet> {
        &self.peers
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.state.mode()
    }

    pub fn accepts_txs(&self) -> bool {
        self.state.accepts_txs()
    }

    pub fn checkpoint(&self) -> Option<(u64, Hash)> {
        self.checkpoint
    }

    pub fn chain_sync(&self) -> &Arc<ChainSync> {
        &self.chain_sync
    }

    pub fn event_mux(&self) -> &EventMux {
        &self.event_mux
    }

    /// Facade for the snapshot protocol over the same peer set
    pub fn snap_handler(&self) -> &SnapHandler {
        &self.snap
    }

    pub fn node_info(&self) -> NodeInfo {
        let head = self.chain.current_block();
        NodeInfo {
            network_id: self.network_id,
            difficulty: self
                .chain
                .total_difficulty(&head.hash, head.number())
                .unwrap_or_default(),
            genesis: self.chain.genesis_hash(),
            head: head.hash,
            sync_mode: self.state.mode(),
        }
    }

    pub fn peer_info(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(id).map(|p| p.info())
    }

    /// Status this node announces in a handshake
    pub fn local_status(&self, version: u32) -> Status {
        let head = self.chain.current_block();
        Status {
            protocol_version: version,
            network_id: self.network_id,
            td: self
                .chain
                .total_difficulty(&head.hash, head.number())
                .unwrap_or_default(),
            head: head.hash,
            genesis: self.chain.genesis_hash(),
            fork_id: self.fork_filter.local(),
        }
    }

    pub fn broadcast_block(&self, block: &Block, propagate: bool) {
        self.broadcaster.broadcast_block(block, propagate)
    }

    pub fn broadcast_transactions(&self, txs: &[Transaction]) {
        self.broadcaster.broadcast_transactions(txs)
    }

    pub fn request_transactions(&self, hashes: &[Hash]) {
        self.broadcaster.request_transactions(hashes)
    }

    /// Send a locally originated consensus packet to every peer
    pub fn broadcast_consensus_data(&self, packet: &ConsensusPacket) {
        // Remember it so echoes from peers are not relayed again
        self.rebroadcast.observe(packet.hash());
        self.broadcaster.broadcast_consensus_data(packet)
    }

    pub fn request_consensus_data(&self, packet: &ConsensusPacket) {
        self.broadcaster.request_consensus_data(packet)
    }
}

/// Import blocks propagated by peers, unless the node is not ready for them
pub fn import_propagated(
    chain: &dyn Chain,
    state: &SyncState,
    checkpoint: Option<u64>,
    blocks: Vec<Block>,
) -> Result<ImportOutcome, ChainError> {
    let height = chain.current_height();
    if let Some(checkpoint) = checkpoint {
        if height < checkpoint {
            log::warn!(
                "Unsynced yet, discarded {} propagated block(s) (height {}, checkpoint {})",
                blocks.len(),
                height,
                checkpoint
            );
            return Ok(ImportOutcome::Deferred(DeferReason::BelowCheckpoint {
                height,
                checkpoint,
            }));
        }
    }
    if state.is_fast_syncing() {
        log::warn!(
            "Fast syncing, discarded {} propagated block(s)",
            blocks.len()
        );
        return Ok(ImportOutcome::Deferred(DeferReason::FastSyncInProgress));
    }

    let imported = chain.insert_chain(blocks)?;
    if imported > 0 && state.enable_tx_acceptance() {
        log::info!("Enabled transaction acceptance after block import");
    }
    Ok(ImportOutcome::Imported(imported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrustedCheckpoint;
    use crate::core::Header;
    use crate::memory::{
        build_chain, ConsensusEvent, IdleDownloader, InlineBlockFetcher, InlineTxFetcher,
        MemoryChain, MemoryTxPool, RecordingConsensus,
    };
    use crate::network::{HashOrNumber, Message, Peer, ETH64, ETH66};

    struct Node {
        handler: Arc<Handler>,
        chain: Arc<MemoryChain>,
        pool: Arc<MemoryTxPool>,
        downloader: Arc<IdleDownloader>,
        txs: Arc<InlineTxFetcher>,
        consensus: Arc<RecordingConsensus>,
    }

    fn node_with(settings: HandlerSettings, chain: MemoryChain) -> Node {
        let chain = Arc::new(chain);
        let pool = Arc::new(MemoryTxPool::new());
        let downloader = Arc::new(IdleDownloader::new());
        let txs = Arc::new(InlineTxFetcher::new());
        let consensus = Arc::new(RecordingConsensus::new());
        let handler = Handler::new(HandlerConfig {
            settings,
            chain: chain.clone(),
            tx_pool: pool.clone(),
            downloader: downloader.clone(),
            block_fetcher: Arc::new(InlineBlockFetcher::new()),
            tx_fetcher: txs.clone(),
            consensus: consensus.clone(),
            event_mux: None,
        })
        .unwrap();
        Node {
            handler: Arc::new(handler),
            chain,
            pool,
            downloader,
            txs,
            consensus,
        }
    }

    fn node(settings: HandlerSettings) -> Node {
        let chain = MemoryChain::new(settings.network_id);
        node_with(settings, chain)
    }

    struct Remote {
        peer: Arc<Peer>,
        tx: mpsc::Sender<Message>,
        rx: mpsc::Receiver<Message>,
        task: JoinHandle<Result<(), HandlerError>>,
    }

    impl Remote {
        async fn send(&self, msg: Message) {
            self.tx.send(msg).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .unwrap()
                .unwrap()
        }

        fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                messages.push(msg);
            }
            messages
        }
    }

    /// Connect a remote that answers the handshake with our own status
    async fn connect(node: &Node, id: &str, version: u32, trusted: bool) -> Remote {
        let (peer, rx) = Peer::new(id, version, trusted);
        let peer = Arc::new(peer);
        let (tx, inbound) = mpsc::channel(64);
        let task = node.handler.spawn_peer(peer.clone(), inbound);
        let mut remote = Remote { peer, tx, rx, task };
        match remote.recv().await {
            Message::Status(status) => remote.send(Message::Status(status)).await,
            other => panic!("unexpected {}", other.type_name()),
        }
        remote
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn registered(node: &Node, id: &str) -> bool {
        node.handler.peers().get(&PeerId::from(id)).is_some()
    }

    fn checkpoint_settings(section_head: Hash) -> HandlerSettings {
        HandlerSettings {
            checkpoint: Some(TrustedCheckpoint {
                section_index: 0,
                section_head,
            }),
            ..HandlerSettings::default()
        }
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let settings = HandlerSettings {
            network_id: 0,
            ..HandlerSettings::default()
        };
        let chain = Arc::new(MemoryChain::new(1));
        let result = Handler::new(HandlerConfig {
            settings,
            chain,
            tx_pool: Arc::new(MemoryTxPool::new()),
            downloader: Arc::new(IdleDownloader::new()),
            block_fetcher: Arc::new(InlineBlockFetcher::new()),
            tx_fetcher: Arc::new(InlineTxFetcher::new()),
            consensus: Arc::new(RecordingConsensus::new()),
            event_mux: None,
        });
        assert!(matches!(result, Err(HandlerError::InvalidConfig(_))));
    }

    #[test]
    fn test_sync_mode_resolution() {
        // Empty full chain with fast progress keeps fast syncing
        let chain = MemoryChain::new(1);
        chain.set_fast_height(40);
        let n = node_with(HandlerSettings::default(), chain);
        assert_eq!(n.handler.sync_mode(), SyncMode::Fast);
        assert!(n.downloader.hooks().unwrap().state_bloom.is_some());

        // Any processed block forces full sync
        let chain = MemoryChain::new(1);
        chain.extend(1, 1).unwrap();
        let settings = HandlerSettings {
            sync_mode: SyncMode::Snap,
            ..HandlerSettings::default()
        };
        let n = node_with(settings, chain);
        assert_eq!(n.handler.sync_mode(), SyncMode::Full);
        assert!(n.downloader.hooks().unwrap().state_bloom.is_none());

        let settings = HandlerSettings {
            sync_mode: SyncMode::Snap,
            ..HandlerSettings::default()
        };
        let n = node(settings);
        assert_eq!(n.handler.sync_mode(), SyncMode::Snap);
        assert!(n.downloader.hooks().unwrap().state_bloom.is_none());
    }

    #[test]
    fn test_import_gating() {
        let chain = MemoryChain::new(1);
        let block = build_chain(&chain.current_block(), 1, 1, &[]);

        let state = SyncState::new(SyncMode::Full);
        let outcome = import_propagated(&chain, &state, Some(100), block.clone()).unwrap();
        assert_eq!(
            outcome,
            ImportOutcome::Deferred(DeferReason::BelowCheckpoint {
                height: 0,
                checkpoint: 100
            })
        );

        let state = SyncState::new(SyncMode::Fast);
        let outcome = import_propagated(&chain, &state, None, block.clone()).unwrap();
        assert_eq!(outcome, ImportOutcome::Deferred(DeferReason::FastSyncInProgress));
        assert_eq!(chain.current_height(), 0);
        assert!(!state.accepts_txs());

        let state = SyncState::new(SyncMode::Full);
        let outcome = import_propagated(&chain, &state, None, block).unwrap();
        assert_eq!(outcome, ImportOutcome::Imported(1));
        assert!(state.accepts_txs());
        assert_eq!(chain.current_height(), 1);
    }

    #[test]
    fn test_import_errors_keep_acceptance_off() {
        let chain = MemoryChain::new(1);
        let orphan = Block::new(Header::new(Hash::digest(&[b"gone"]), 4, 1), vec![]);
        let state = SyncState::new(SyncMode::Full);
        assert!(import_propagated(&chain, &state, None, vec![orphan]).is_err());
        assert!(!state.accepts_txs());
    }

    #[tokio::test]
    async fn test_tx_fetch_hook_rejects_unknown_peer() {
        let n = node(HandlerSettings::default());
        let hooks = n.txs.hooks().unwrap();
        assert_eq!(
            (hooks.fetch)(&PeerId::from("ghost"), vec![Hash::ZERO]),
            Err(FetcherError::UnknownPeer(PeerId::from("ghost")))
        );
    }

    #[tokio::test]
    async fn test_peer_cap_with_trusted_bypass() {
        let n = node(HandlerSettings::default());
        n.handler.start(1);

        let _a = connect(&n, "a", ETH66, false).await;
        wait_until(|| registered(&n, "a")).await;

        let b = connect(&n, "b", ETH66, false).await;
        assert_eq!(b.task.await.unwrap(), Err(HandlerError::TooManyPeers));
        assert!(!registered(&n, "b"));

        let _c = connect(&n, "c", ETH66, true).await;
        wait_until(|| registered(&n, "c")).await;
        assert_eq!(n.handler.peers().len(), 2);

        // Still full with one trusted and one untrusted peer
        let d = connect(&n, "d", ETH66, false).await;
        assert_eq!(d.task.await.unwrap(), Err(HandlerError::TooManyPeers));
        let _e = connect(&n, "e", ETH66, true).await;
        wait_until(|| registered(&n, "e")).await;
        assert_eq!(n.handler.peers().len(), 3);

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_banned_peer_is_unregistered() {
        let n = node(HandlerSettings::default());
        n.downloader.ban("x");
        n.handler.start(10);

        let x = connect(&n, "x", ETH66, false).await;
        assert_eq!(
            x.task.await.unwrap(),
            Err(HandlerError::Downloader(DownloaderError::Banned(PeerId::from("x"))))
        );
        assert!(n.handler.peers().is_empty());
        assert!(x.peer.is_closed());
        wait_until(|| n.consensus.events().len() == 2).await;
        assert_eq!(
            n.consensus.events(),
            vec![
                ConsensusEvent::Connected(PeerId::from("x")),
                ConsensusEvent::Disconnected(PeerId::from("x")),
            ]
        );

        n.handler.stop().await;
    }

    /// Relay target that is slow to accept new peers
    #[derive(Default)]
    struct SlowConsensus {
        events: Mutex<Vec<ConsensusEvent>>,
    }

    impl ConsensusHandler for SlowConsensus {
        fn on_peer_connected(&self, peer: &PeerId) -> Result<(), crate::consensus::ConsensusError> {
            std::thread::sleep(Duration::from_millis(50));
            self.events.lock().push(ConsensusEvent::Connected(peer.clone()));
            Ok(())
        }

        fn on_peer_disconnected(&self, peer: &PeerId) -> Result<(), crate::consensus::ConsensusError> {
            self.events.lock().push(ConsensusEvent::Disconnected(peer.clone()));
            Ok(())
        }

        fn handle_consensus_packet(&self, _packet: &ConsensusPacket) -> Result<(), crate::consensus::ConsensusError> {
            Ok(())
        }

        fn handle_request_consensus_data(
            &self,
            _packet: &ConsensusPacket,
        ) -> Result<Vec<ConsensusPacket>, crate::consensus::ConsensusError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_relay_notifications_keep_peer_order() {
        let consensus = Arc::new(SlowConsensus::default());
        let downloader = Arc::new(IdleDownloader::new());
        downloader.ban("x");
        let handler = Arc::new(
            Handler::new(HandlerConfig {
                settings: HandlerSettings::default(),
                chain: Arc::new(MemoryChain::new(1)),
                tx_pool: Arc::new(MemoryTxPool::new()),
                downloader,
                block_fetcher: Arc::new(InlineBlockFetcher::new()),
                tx_fetcher: Arc::new(InlineTxFetcher::new()),
                consensus: consensus.clone(),
                event_mux: None,
            })
            .unwrap(),
        );
        handler.start(10);

        let (peer, mut rx) = Peer::new("x", ETH66, false);
        let (tx, inbound) = mpsc::channel(64);
        let task = handler.spawn_peer(Arc::new(peer), inbound);
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(Message::Status(status)) => tx.send(Message::Status(status)).await.unwrap(),
            other => panic!("unexpected {:?}", other.map(|m| m.type_name())),
        }
        assert_eq!(
            task.await.unwrap(),
            Err(HandlerError::Downloader(DownloaderError::Banned(PeerId::from("x"))))
        );

        // Stopping flushes the queued notifications
        handler.stop().await;
        assert_eq!(
            *consensus.events.lock(),
            vec![
                ConsensusEvent::Connected(PeerId::from("x")),
                ConsensusEvent::Disconnected(PeerId::from("x")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_challenge_timeout_drops_peer_once() {
        let n = node(checkpoint_settings(Hash::digest(&[b"section"])));
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        match a.recv().await {
            Message::GetBlockHeaders { origin, amount } => {
                assert_eq!(origin, HashOrNumber::Number(32767));
                assert_eq!(amount, 1);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(registered(&n, "a"));

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(a.task.await.unwrap(), Err(HandlerError::Disconnected));
        assert!(!registered(&n, "a"));
        assert_eq!(n.downloader.unregistered_peers(), vec![PeerId::from("a")]);

        wait_until(|| n.consensus.events().len() == 2).await;
        let disconnects = n
            .consensus
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConsensusEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnects, 1);

        n.handler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_timer_disarmed_on_early_exit() {
        let n = node(checkpoint_settings(Hash::digest(&[b"section"])));
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        assert!(matches!(a.recv().await, Message::GetBlockHeaders { .. }));
        assert!(a.peer.has_challenge());

        let Remote { peer, tx, task, .. } = a;
        drop(tx);
        assert_eq!(task.await.unwrap(), Ok(()));
        assert!(!peer.has_challenge());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(n.downloader.unregistered_peers(), vec![PeerId::from("a")]);

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_checkpoint_reply_validated() {
        let good = Header::new(Hash::digest(&[b"parent"]), 32767, 1);
        let n = node(checkpoint_settings(good.hash()));
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        assert!(matches!(a.recv().await, Message::GetBlockHeaders { .. }));
        a.send(Message::BlockHeaders(vec![good])).await;
        wait_until(|| !a.peer.has_challenge()).await;
        assert!(registered(&n, "a"));
        assert!(n.downloader.delivered_headers().is_empty());

        let mut b = connect(&n, "b", ETH66, false).await;
        assert!(matches!(b.recv().await, Message::GetBlockHeaders { .. }));
        let forged = Header::new(Hash::digest(&[b"forged"]), 32767, 1);
        b.send(Message::BlockHeaders(vec![forged])).await;
        assert_eq!(b.task.await.unwrap(), Err(HandlerError::CheckpointMismatch));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_whitelist_mismatch_drops_peer() {
        let mut settings = HandlerSettings::default();
        settings.whitelist.insert(5, Hash::digest(&[b"pinned"]));
        let n = node(settings);
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        match a.recv().await {
            Message::GetBlockHeaders { origin, .. } => assert_eq!(origin, HashOrNumber::Number(5)),
            other => panic!("unexpected {}", other.type_name()),
        }
        let header = Header::new(Hash::ZERO, 5, 1);
        a.send(Message::BlockHeaders(vec![header])).await;
        assert_eq!(a.task.await.unwrap(), Err(HandlerError::WhitelistMismatch(5)));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_header_without_number_skips_pins() {
        let mut settings = HandlerSettings::default();
        settings.whitelist.insert(0, Hash::digest(&[b"pinned"]));
        let n = node(settings);
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        match a.recv().await {
            Message::GetBlockHeaders { origin, .. } => assert_eq!(origin, HashOrNumber::Number(0)),
            other => panic!("unexpected {}", other.type_name()),
        }
        let mut header = Header::new(Hash::ZERO, 0, 1);
        header.number = None;
        a.send(Message::BlockHeaders(vec![header])).await;

        wait_until(|| n.downloader.delivered_headers().len() == 1).await;
        assert!(registered(&n, "a"));
        assert!(!a.peer.is_closed());

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_transactions_accepted_after_first_import() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let a = connect(&n, "a", ETH66, false).await;
        wait_until(|| registered(&n, "a")).await;

        let tx = Transaction::new("alice", 0, vec![1]);
        a.send(Message::Transactions(vec![tx.clone()])).await;

        let block = build_chain(&n.chain.current_block(), 1, 1, &[]).remove(0);
        a.send(Message::NewBlock {
            block: block.clone(),
            td: 2,
        })
        .await;
        wait_until(|| n.chain.current_height() == 1).await;
        assert!(n.handler.accepts_txs());
        // Sent while syncing, so it was ignored
        assert!(!n.pool.has(&tx.hash()));

        a.send(Message::Transactions(vec![tx.clone()])).await;
        wait_until(|| n.pool.has(&tx.hash())).await;
        assert!(a.peer.knows_transaction(&tx.hash()));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_new_block_updates_peer_head() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let a = connect(&n, "a", ETH66, false).await;
        wait_until(|| registered(&n, "a")).await;

        let genesis = n.chain.current_block();
        let block = build_chain(&genesis, 1, 3, &[]).remove(0);
        a.send(Message::NewBlock { block, td: 50 }).await;
        wait_until(|| a.peer.head().1 == 47).await;
        assert_eq!(a.peer.head().0, genesis.hash);

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_new_block_without_number_is_rejected() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let a = connect(&n, "a", ETH66, false).await;

        let mut block = build_chain(&n.chain.current_block(), 1, 1, &[]).remove(0);
        block.header.number = None;
        a.send(Message::NewBlock { block, td: 2 }).await;
        assert!(matches!(
            a.task.await.unwrap(),
            Err(HandlerError::InvalidBlock(_))
        ));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_consensus_packets_relayed_once() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let mut remotes = Vec::new();
        for id in ["a", "b", "c"] {
            let remote = connect(&n, id, ETH66, false).await;
            wait_until(|| registered(&n, id)).await;
            remotes.push(remote);
        }

        let vote = ConsensusPacket::new(1, b"vote".to_vec());
        let marker = ConsensusPacket::new(2, b"marker".to_vec());
        remotes[0].send(Message::ConsensusPacket(vote.clone())).await;
        remotes[0].send(Message::ConsensusPacket(vote.clone())).await;
        remotes[0].send(Message::ConsensusPacket(marker.clone())).await;

        for remote in remotes.iter_mut().skip(1) {
            let first = remote.recv().await;
            let second = remote.recv().await;
            assert!(matches!(first, Message::ConsensusPacket(p) if p == vote));
            assert!(matches!(second, Message::ConsensusPacket(p) if p == marker));
        }
        assert!(remotes[0].drain().is_empty());

        let packets = n
            .consensus
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConsensusEvent::Packet(_)))
            .count();
        assert_eq!(packets, 2);

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_local_consensus_broadcast_not_echoed() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let mut a = connect(&n, "a", ETH66, false).await;
        let mut b = connect(&n, "b", ETH66, false).await;
        wait_until(|| n.handler.peers().len() == 2).await;

        let proposal = ConsensusPacket::new(7, b"proposal".to_vec());
        n.handler.broadcast_consensus_data(&proposal);
        assert!(matches!(a.recv().await, Message::ConsensusPacket(p) if p == proposal));
        assert!(matches!(b.recv().await, Message::ConsensusPacket(p) if p == proposal));

        // The echo from a is suppressed instead of bouncing to b
        let marker = ConsensusPacket::new(8, b"marker".to_vec());
        a.send(Message::ConsensusPacket(proposal)).await;
        a.send(Message::ConsensusPacket(marker.clone())).await;
        assert!(matches!(b.recv().await, Message::ConsensusPacket(p) if p == marker));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_consensus_data_request_answered() {
        let n = node(HandlerSettings::default());
        let reply = ConsensusPacket::new(3, b"state".to_vec());
        n.consensus.set_replies(vec![reply.clone()]);
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        a.send(Message::RequestConsensusData(ConsensusPacket::new(3, vec![])))
            .await;
        assert!(matches!(a.recv().await, Message::ConsensusPacket(p) if p == reply));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_headers_served() {
        let chain = MemoryChain::new(1);
        let blocks = chain.extend(5, 1).unwrap();
        let n = node_with(HandlerSettings::default(), chain);
        n.handler.start(10);

        let mut a = connect(&n, "a", ETH66, false).await;
        a.send(Message::GetBlockHeaders {
            origin: HashOrNumber::Number(2),
            amount: 10,
        })
        .await;
        match a.recv().await {
            Message::BlockHeaders(headers) => {
                let numbers: Vec<_> = headers.iter().map(|h| h.number.unwrap()).collect();
                assert_eq!(numbers, vec![2, 3, 4, 5]);
            }
            other => panic!("unexpected {}", other.type_name()),
        }

        a.send(Message::GetBlockHeaders {
            origin: HashOrNumber::Hash(blocks[3].hash),
            amount: 1,
        })
        .await;
        assert!(matches!(a.recv().await, Message::BlockHeaders(h) if h == vec![blocks[3].header.clone()]));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_pending_transactions_synced_to_new_peers() {
        let n = node(HandlerSettings::default());
        let txs: Vec<Transaction> = (0..3).map(|i| Transaction::new("dave", i, vec![])).collect();
        n.pool.add_locals(txs.clone());
        n.handler.start(10);

        let mut modern = connect(&n, "modern", ETH66, false).await;
        match modern.recv().await {
            Message::NewPooledTransactionHashes(hashes) => assert_eq!(hashes.len(), 3),
            other => panic!("unexpected {}", other.type_name()),
        }

        let mut legacy = connect(&n, "legacy", ETH64, false).await;
        match legacy.recv().await {
            Message::Transactions(sent) => assert_eq!(sent, txs),
            other => panic!("unexpected {}", other.type_name()),
        }

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_mined_block_propagated_then_announced() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let mut remotes = Vec::new();
        for id in ["a", "b", "c", "d"] {
            remotes.push(connect(&n, id, ETH66, false).await);
        }
        wait_until(|| n.handler.peers().len() == 4).await;

        let block = n.chain.extend(1, 1).unwrap().remove(0);
        n.handler.event_mux().post(block.clone());

        let mut full = 0;
        let mut announced = 0;
        for remote in remotes.iter_mut() {
            match remote.recv().await {
                Message::NewBlock { block: sent, .. } if sent.hash == block.hash => full += 1,
                Message::NewBlockHashes(anns) if anns[0].hash == block.hash => announced += 1,
                other => panic!("unexpected {}", other.type_name()),
            }
        }
        assert_eq!((full, announced), (2, 2));

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_pool_transactions_broadcast() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let mut a = connect(&n, "a", ETH66, false).await;
        wait_until(|| registered(&n, "a")).await;

        let tx = Transaction::new("erin", 0, vec![]);
        n.pool.add_locals(vec![tx.clone()]);
        match a.recv().await {
            Message::Transactions(sent) => assert_eq!(sent, vec![tx]),
            other => panic!("unexpected {}", other.type_name()),
        }

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_snap_packet_requires_extension() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let a = connect(&n, "a", ETH66, false).await;

        // One facade for the handler's lifetime, over the live registry
        let snap = n.handler.snap_handler();
        assert!(std::ptr::eq(snap, n.handler.snap_handler()));
        wait_until(|| registered(&n, "a")).await;
        assert!(snap.peer_info(&PeerId::from("a")).is_none());

        let packet = crate::network::SnapPacket {
            code: 0,
            request_id: 1,
            payload: vec![],
        };
        a.send(Message::Snap(packet)).await;
        assert_eq!(
            a.task.await.unwrap(),
            Err(HandlerError::UnexpectedMessage("Snap"))
        );

        n.handler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_registry_and_waits_for_peers() {
        let n = node(HandlerSettings::default());
        n.handler.start(10);
        let a = connect(&n, "a", ETH66, false).await;
        wait_until(|| registered(&n, "a")).await;

        n.handler.stop().await;
        assert!(n.handler.peers().is_closed());
        assert_eq!(a.task.await.unwrap(), Err(HandlerError::Disconnected));

        let (late, _rx) = Peer::new("late", ETH66, false);
        let (_tx, inbound) = mpsc::channel(1);
        assert_eq!(
            n.handler.run_eth_peer(Arc::new(late), inbound).await,
            Err(HandlerError::Quitting)
        );

        // Stopping twice is harmless
        n.handler.stop().await;
    }

    #[test]
    fn test_node_info() {
        let n = node(HandlerSettings::default());
        let info = n.handler.node_info();
        assert_eq!(info.network_id, 1);
        assert_eq!(info.difficulty, 1);
        assert_eq!(info.head, info.genesis);
        assert_eq!(info.sync_mode, SyncMode::Full);
        assert_eq!(n.handler.peer_info(&PeerId::from("nobody")), None);
    }
}
