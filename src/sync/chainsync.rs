//! Chain synchronization orchestrator
//!
//! Decides when to start a long-range sync and against which peer. Woken
//! by peer events and by a periodic force timer that lowers the peer
//! threshold when the network is sparse.

use crate::core::Chain;
use crate::crypto::Hash;
use crate::network::{Broadcaster, Peer, PeerId, PeerSet};
use crate::sync::downloader::{ChainDownloader, DownloaderError};
use crate::sync::mode::{SyncMode, SyncState};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Peers wanted before a sync starts without being forced
pub const MIN_DESIRED_PEERS: usize = 5;

/// Interval after which a sync is attempted with any single peer
pub const FORCE_SYNC_CYCLE: Duration = Duration::from_secs(10);

/// A sync the orchestrator decided to run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOp {
    pub peer: PeerId,
    pub head: Hash,
    pub td: u128,
    pub mode: SyncMode,
}

/// Chain synchronization manager
pub struct ChainSync {
    chain: Arc<dyn Chain>,
    peers: Arc<PeerSet>,
    downloader: Arc<dyn ChainDownloader>,
    state: Arc<SyncState>,
    broadcaster: Arc<Broadcaster>,
    /// Trusted checkpoint height, zero if none
    checkpoint: u64,
    max_peers: AtomicUsize,
    forced: AtomicBool,
    syncing: AtomicBool,
    wake: Notify,
    quit: CancellationToken,
}

impl ChainSync {
    pub fn new(
        chain: Arc<dyn Chain>,
        peers: Arc<PeerSet>,
        downloader: Arc<dyn ChainDownloader>,
        state: Arc<SyncState>,
        broadcaster: Arc<Broadcaster>,
        checkpoint: u64,
        quit: CancellationToken,
    ) -> Self {
        Self {
            chain,
            peers,
            downloader,
            state,
            broadcaster,
            checkpoint,
            max_peers: AtomicUsize::new(MIN_DESIRED_PEERS),
            forced: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            wake: Notify::new(),
            quit,
        }
    }

    pub fn set_max_peers(&self, max_peers: usize) {
        self.max_peers.store(max_peers, Ordering::Release);
    }

    /// Notify about a joining or updated peer; false once quitting
    pub fn handle_peer_event(&self, peer: &Peer) -> bool {
        if self.quit.is_cancelled() {
            return false;
        }
        log::trace!("Sync event from {}", peer.id());
        self.wake.notify_one();
        true
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Main loop, returns once the quit token fires
    pub async fn run(&self) {
        let mut force = tokio::time::interval_at(
            tokio::time::Instant::now() + FORCE_SYNC_CYCLE,
            FORCE_SYNC_CYCLE,
        );

        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = force.tick() => {
                    self.forced.store(true, Ordering::Release);
                }
            }

            let Some(op) = self.next_sync_op() else {
                continue;
            };
            self.forced.store(false, Ordering::Release);
            force.reset();

            tokio::select! {
                _ = self.quit.cancelled() => break,
                result = self.do_sync(&op) => {
                    if let Err(e) = result {
                        log::warn!("Sync with {} failed: {}", op.peer, e);
                    }
                }
            }
        }
        log::debug!("Chain sync loop stopped");
    }

    /// Decide whether a sync should start now
    pub fn next_sync_op(&self) -> Option<SyncOp> {
        if self.is_syncing() {
            return None;
        }

        let min_peers = if self.forced.load(Ordering::Acquire) {
            1
        } else {
            MIN_DESIRED_PEERS.min(self.max_peers.load(Ordering::Acquire))
        };
        if self.peers.len() < min_peers {
            return None;
        }

        let peer = self.peers.best_peer()?;
        let (head, td) = peer.head();
        let ours = self.local_td();
        if td <= ours {
            return None;
        }

        Some(SyncOp {
            peer: peer.id().clone(),
            head,
            td,
            mode: self.state.mode(),
        })
    }

    fn local_td(&self) -> u128 {
        let head = self.chain.current_block();
        self.chain
            .total_difficulty(&head.hash, head.number())
            .unwrap_or_default()
    }

    /// Run one sync cycle and apply its consequences
    pub async fn do_sync(&self, op: &SyncOp) -> Result<(), DownloaderError> {
        if self.syncing.swap(true, Ordering::AcqRel) {
            return Err(DownloaderError::Busy);
        }
        log::info!(
            "Synchronising with {} (td {} vs {}, mode {})",
            op.peer,
            op.td,
            self.local_td(),
            op.mode
        );
        let result = self
            .downloader
            .synchronise(&op.peer, op.head, op.td, op.mode)
            .await;
        self.syncing.store(false, Ordering::Release);
        result?;

        if self.state.mode() != SyncMode::Full {
            log::info!("{} sync complete, auto disabling", self.state.mode());
            self.state.set_mode(SyncMode::Full);
        }

        let head = self.chain.current_block();
        if head.number() >= self.checkpoint && self.state.enable_tx_acceptance() {
            log::info!("Enabled transaction acceptance at height {}", head.number());
        }
        if head.number() > 0 {
            // Let peers that were ahead of us learn about our new head too
            self.broadcaster.broadcast_block(&head, false);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, Header};
    use crate::memory::{IdleDownloader, MemoryChain};
    use crate::network::{Message, ETH66};
    use tokio::sync::mpsc;

    struct Harness {
        chain: Arc<MemoryChain>,
        peers: Arc<PeerSet>,
        downloader: Arc<IdleDownloader>,
        state: Arc<SyncState>,
        sync: ChainSync,
        quit: CancellationToken,
    }

    fn harness(mode: SyncMode, checkpoint: u64) -> Harness {
        let chain = Arc::new(MemoryChain::new(1));
        let peers = Arc::new(PeerSet::new());
        let downloader = Arc::new(IdleDownloader::new());
        let state = Arc::new(SyncState::new(mode));
        let broadcaster = Arc::new(Broadcaster::new(peers.clone(), chain.clone()));
        let quit = CancellationToken::new();
        let sync = ChainSync::new(
            chain.clone(),
            peers.clone(),
            downloader.clone(),
            state.clone(),
            broadcaster,
            checkpoint,
            quit.clone(),
        );
        Harness {
            chain,
            peers,
            downloader,
            state,
            sync,
            quit,
        }
    }

    fn add_peer(peers: &PeerSet, id: &str, td: u128) -> (Arc<Peer>, mpsc::Receiver<Message>) {
        let (peer, rx) = Peer::new(id, ETH66, false);
        let peer = Arc::new(peer);
        peer.set_head(Hash::digest(&[id.as_bytes()]), td);
        peers.register(peer.clone()).unwrap();
        (peer, rx)
    }

    #[test]
    fn test_peer_event_rejected_after_quit() {
        let h = harness(SyncMode::Full, 0);
        let (peer, _rx) = add_peer(&h.peers, "a", 10);
        assert!(h.sync.handle_peer_event(&peer));
        h.quit.cancel();
        assert!(!h.sync.handle_peer_event(&peer));
    }

    #[test]
    fn test_waits_for_enough_peers_unless_forced() {
        let h = harness(SyncMode::Full, 0);
        let _peers: Vec<_> = (0..3).map(|i| add_peer(&h.peers, &format!("p{}", i), 10 + i)).collect();

        assert_eq!(h.sync.next_sync_op(), None);

        h.sync.set_max_peers(3);
        let op = h.sync.next_sync_op().unwrap();
        assert_eq!(op.peer, PeerId::from("p2"));
        assert_eq!(op.td, 12);

        h.sync.set_max_peers(50);
        h.sync.forced.store(true, Ordering::Release);
        assert!(h.sync.next_sync_op().is_some());
    }

    #[test]
    fn test_no_sync_when_not_behind() {
        let h = harness(SyncMode::Full, 0);
        h.sync.set_max_peers(1);
        let _a = add_peer(&h.peers, "a", 1);
        // Genesis difficulty is 1, so an equal peer is not worth syncing from
        assert_eq!(h.sync.next_sync_op(), None);
    }

    #[tokio::test]
    async fn test_successful_sync_switches_to_full_and_announces() {
        let h = harness(SyncMode::Fast, 1);
        let (_peer, mut rx) = add_peer(&h.peers, "a", 100);
        let head = h.chain.current_block();
        let next = Block::new(Header::new(head.hash, 1, 3), vec![]);
        h.downloader.set_import(vec![next.clone()], h.chain.clone());

        h.sync.set_max_peers(1);
        let op = h.sync.next_sync_op().unwrap();
        assert_eq!(op.mode, SyncMode::Fast);
        h.sync.do_sync(&op).await.unwrap();

        assert_eq!(h.state.mode(), SyncMode::Full);
        assert!(h.state.accepts_txs());
        assert_eq!(h.downloader.sync_calls(), vec![op]);
        match rx.try_recv().unwrap() {
            Message::NewBlockHashes(anns) => assert_eq!(anns[0].hash, next.hash),
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_failed_sync_keeps_mode() {
        let h = harness(SyncMode::Snap, 0);
        let _a = add_peer(&h.peers, "a", 100);
        h.downloader.fail_next_sync();
        h.sync.set_max_peers(1);

        let op = h.sync.next_sync_op().unwrap();
        assert!(h.sync.do_sync(&op).await.is_err());
        assert_eq!(h.state.mode(), SyncMode::Snap);
        assert!(!h.state.accepts_txs());
        assert!(!h.sync.is_syncing());
    }

    #[tokio::test]
    async fn test_run_loop_syncs_on_event_and_stops() {
        let h = Arc::new(harness(SyncMode::Full, 0));
        h.sync.set_max_peers(1);
        let runner = {
            let h = h.clone();
            tokio::spawn(async move { h.sync.run().await })
        };

        let (peer, _rx) = add_peer(&h.peers, "a", 100);
        assert!(h.sync.handle_peer_event(&peer));

        for _ in 0..100 {
            if !h.downloader.sync_calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(h.downloader.sync_calls().len(), 1);

        h.quit.cancel();
        runner.await.unwrap();
    }
}
