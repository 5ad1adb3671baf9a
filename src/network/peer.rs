//! Peer sessions
//!
//! A `Peer` holds the negotiated state of one connection: protocol
//! version, trust, the head it advertised, what it is known to have seen,
//! and the queue of outbound messages drained by the wire layer.

use crate::core::{Block, Transaction};
use crate::crypto::Hash;
use crate::network::message::{BlockAnnouncement, HashOrNumber, Message, ETH65};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

/// Maximum block hashes remembered per peer
pub const MAX_KNOWN_BLOCKS: usize = 1024;

/// Maximum transaction hashes remembered per peer
pub const MAX_KNOWN_TXS: usize = 32768;

/// Outbound messages buffered per peer before broadcasts start dropping
pub const MAX_QUEUED_MESSAGES: usize = 256;

/// Peer send errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PeerError {
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Peer send queue full")]
    QueueFull,
}

/// Identifier of a connected peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Snapshot protocol extension negotiated alongside the main protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapExtension {
    pub version: u32,
}

/// Public view of a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub version: u32,
    pub difficulty: u128,
    pub head: Hash,
}

/// Bounded set of hashes, evicting the oldest first
#[derive(Debug)]
struct KnownCache {
    set: HashSet<Hash>,
    order: VecDeque<Hash>,
    capacity: usize,
}

impl KnownCache {
    fn new(capacity: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, hash: Hash) {
        if !self.set.insert(hash) {
            return;
        }
        self.order.push_back(hash);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.set.contains(hash)
    }

    fn len(&self) -> usize {
        self.set.len()
    }
}

/// A connected peer session
pub struct Peer {
    id: PeerId,
    version: u32,
    trusted: bool,
    snap: Option<SnapExtension>,
    tx: mpsc::Sender<Message>,
    /// Advertised head hash and total difficulty
    head: RwLock<(Hash, u128)>,
    known_blocks: Mutex<KnownCache>,
    known_txs: Mutex<KnownCache>,
    /// Cancelled when the session must end
    closed: CancellationToken,
    /// Armed checkpoint challenge timer
    challenge: Mutex<Option<AbortHandle>>,
}

impl Peer {
    /// Create a session; the receiver yields messages to write to the wire
    pub fn new(id: impl Into<PeerId>, version: u32, trusted: bool) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(MAX_QUEUED_MESSAGES);
        let peer = Self {
            id: id.into(),
            version,
            trusted,
            snap: None,
            tx,
            head: RwLock::new((Hash::ZERO, 0)),
            known_blocks: Mutex::new(KnownCache::new(MAX_KNOWN_BLOCKS)),
            known_txs: Mutex::new(KnownCache::new(MAX_KNOWN_TXS)),
            closed: CancellationToken::new(),
            challenge: Mutex::new(None),
        };
        (peer, rx)
    }

    /// Attach the snapshot protocol extension
    pub fn with_snap(mut self, version: u32) -> Self {
        self.snap = Some(SnapExtension { version });
        self
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn snap(&self) -> Option<SnapExtension> {
        self.snap
    }

    pub fn head(&self) -> (Hash, u128) {
        *self.head.read()
    }

    pub fn set_head(&self, hash: Hash, td: u128) {
        *self.head.write() = (hash, td);
    }

    pub fn info(&self) -> PeerInfo {
        let (head, difficulty) = self.head();
        PeerInfo {
            version: self.version,
            difficulty,
            head,
        }
    }

    pub fn mark_block(&self, hash: Hash) {
        self.known_blocks.lock().insert(hash);
    }

    pub fn knows_block(&self, hash: &Hash) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    pub fn mark_transaction(&self, hash: Hash) {
        self.known_txs.lock().insert(hash);
    }

    pub fn knows_transaction(&self, hash: &Hash) -> bool {
        self.known_txs.lock().contains(hash)
    }

    pub fn known_transaction_count(&self) -> usize {
        self.known_txs.lock().len()
    }

    /// Queue a message without waiting; fails if the queue is full
    pub fn queue(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }

    /// Send a message, waiting for queue space
    pub async fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.send(msg).await.map_err(|_| PeerError::Disconnected)
    }

    /// Queue a full block and mark it known
    pub fn send_new_block(&self, block: &Block, td: u128) -> Result<(), PeerError> {
        self.queue(Message::NewBlock {
            block: block.clone(),
            td,
        })?;
        self.mark_block(block.hash);
        Ok(())
    }

    /// Queue a block announcement and mark the blocks known
    pub fn send_new_block_hashes(&self, announcements: Vec<BlockAnnouncement>) -> Result<(), PeerError> {
        let hashes: Vec<Hash> = announcements.iter().map(|a| a.hash).collect();
        self.queue(Message::NewBlockHashes(announcements))?;
        for hash in hashes {
            self.mark_block(hash);
        }
        Ok(())
    }

    /// Queue full transactions and mark them known
    pub fn send_transactions(&self, txs: Vec<Transaction>) -> Result<(), PeerError> {
        let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        self.queue(Message::Transactions(txs))?;
        for hash in hashes {
            self.mark_transaction(hash);
        }
        Ok(())
    }

    /// Queue a pooled transaction announcement and mark the hashes known
    pub fn send_pooled_transaction_hashes(&self, hashes: Vec<Hash>) -> Result<(), PeerError> {
        self.queue(Message::NewPooledTransactionHashes(hashes.clone()))?;
        for hash in hashes {
            self.mark_transaction(hash);
        }
        Ok(())
    }

    /// Whether the peer understands pooled transaction announcements
    pub fn supports_pooled_announcements(&self) -> bool {
        self.version >= ETH65
    }

    pub fn request_transactions(&self, hashes: Vec<Hash>) -> Result<(), PeerError> {
        self.queue(Message::GetPooledTransactions(hashes))
    }

    pub async fn request_headers_by_number(&self, number: u64, amount: u64) -> Result<(), PeerError> {
        log::debug!("Requesting {} header(s) from {} at {}", amount, self.id, number);
        self.send(Message::GetBlockHeaders {
            origin: HashOrNumber::Number(number),
            amount,
        })
        .await
    }

    /// Arm the checkpoint challenge timer, replacing any earlier one
    pub fn arm_challenge(&self, timer: AbortHandle) {
        if let Some(previous) = self.challenge.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Disarm the checkpoint challenge; returns true if one was armed
    pub fn disarm_challenge(&self) -> bool {
        match self.challenge.lock().take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_challenge(&self) -> bool {
        self.challenge.lock().is_some()
    }

    /// Ask the session to end
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once `disconnect` was called
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("trusted", &self.trusted)
            .field("snap", &self.snap)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::ETH64;

    #[test]
    fn test_known_cache_evicts_oldest() {
        let mut cache = KnownCache::new(3);
        let hashes: Vec<Hash> = (0u8..4).map(|i| Hash::digest(&[&[i]])).collect();
        for hash in &hashes {
            cache.insert(*hash);
        }
        cache.insert(hashes[3]);

        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&hashes[0]));
        assert!(cache.contains(&hashes[1]));
        assert!(cache.contains(&hashes[3]));
    }

    #[tokio::test]
    async fn test_send_marks_known() {
        let (peer, mut rx) = Peer::new("peer-1", ETH64, false);
        let block = Block::genesis(1);

        peer.send_new_block(&block, 7).unwrap();
        assert!(peer.knows_block(&block.hash));

        match rx.recv().await.unwrap() {
            Message::NewBlock { block: sent, td } => {
                assert_eq!(sent.hash, block.hash);
                assert_eq!(td, 7);
            }
            other => panic!("unexpected message {}", other.type_name()),
        }
        assert!(!peer.supports_pooled_announcements());
    }

    #[test]
    fn test_queue_full_and_closed() {
        let (peer, rx) = Peer::new("peer-2", ETH65, false);
        for _ in 0..MAX_QUEUED_MESSAGES {
            peer.queue(Message::Transactions(vec![])).unwrap();
        }
        assert_eq!(
            peer.queue(Message::Transactions(vec![])),
            Err(PeerError::QueueFull)
        );

        drop(rx);
        assert_eq!(
            peer.queue(Message::Transactions(vec![])),
            Err(PeerError::Disconnected)
        );
    }

    #[test]
    fn test_failed_send_does_not_mark() {
        let (peer, rx) = Peer::new("peer-3", ETH65, false);
        drop(rx);
        let tx = Transaction::new("alice", 0, vec![]);
        assert!(peer.send_transactions(vec![tx.clone()]).is_err());
        assert!(!peer.knows_transaction(&tx.hash()));
    }

    #[tokio::test]
    async fn test_challenge_disarm() {
        let (peer, _rx) = Peer::new("peer-4", ETH65, false);
        assert!(!peer.disarm_challenge());

        let timer = tokio::spawn(std::future::pending::<()>());
        peer.arm_challenge(timer.abort_handle());
        assert!(peer.has_challenge());
        assert!(peer.disarm_challenge());
        assert!(timer.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_snap_extension() {
        let (peer, _rx) = Peer::new("peer-5", ETH65, true);
        assert!(peer.snap().is_none());
        let peer = peer.with_snap(1);
        assert_eq!(peer.snap(), Some(SnapExtension { version: 1 }));
        assert!(peer.is_trusted());
    }
}
