//! Short-range block and transaction fetcher contracts

use crate::consensus::ConsensusError;
use crate::core::{Block, ChainError, Header, PoolError, Transaction};
use crate::crypto::Hash;
use crate::network::{BlockAnnouncement, PeerError, PeerId};
use crate::sync::downloader::{DropPeerFn, HeightFn};
use std::sync::Arc;
use thiserror::Error;

/// Fetcher errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetcherError {
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Fetcher terminated")]
    Terminated,
}

/// Why a propagated block batch was not imported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// A fast or snap sync is still running
    FastSyncInProgress,
    /// The local head is not yet past the trusted checkpoint
    BelowCheckpoint { height: u64, checkpoint: u64 },
}

/// Result of handing propagated blocks to the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOutcome {
    Imported(usize),
    Deferred(DeferReason),
}

pub type VerifyHeaderFn = Arc<dyn Fn(&Header) -> Result<(), ConsensusError> + Send + Sync>;
pub type InsertChainFn = Arc<dyn Fn(Vec<Block>) -> Result<ImportOutcome, ChainError> + Send + Sync>;
pub type BroadcastBlockFn = Arc<dyn Fn(&Block, bool) + Send + Sync>;

/// Callbacks the handler installs into the block fetcher
#[derive(Clone)]
pub struct BlockFetcherHooks {
    pub height: HeightFn,
    pub verify_header: VerifyHeaderFn,
    pub insert_chain: InsertChainFn,
    pub broadcast_block: BroadcastBlockFn,
    pub drop_peer: DropPeerFn,
}

/// Assembles announced and propagated blocks near the head
pub trait BlockFetcher: Send + Sync {
    fn install(&self, hooks: BlockFetcherHooks);

    /// A peer announced a block by hash
    fn notify(&self, peer: &PeerId, announcement: BlockAnnouncement) -> Result<(), FetcherError>;

    /// A peer propagated a full block
    fn enqueue(&self, peer: &PeerId, block: Block) -> Result<(), FetcherError>;
}

pub type HasTxFn = Arc<dyn Fn(&Hash) -> bool + Send + Sync>;
pub type AddTxsFn = Arc<dyn Fn(Vec<Transaction>) -> Vec<Result<(), PoolError>> + Send + Sync>;
pub type FetchTxsFn = Arc<dyn Fn(&PeerId, Vec<Hash>) -> Result<(), FetcherError> + Send + Sync>;

/// Callbacks the handler installs into the transaction fetcher
#[derive(Clone)]
pub struct TxFetcherHooks {
    pub has: HasTxFn,
    pub add: AddTxsFn,
    pub fetch: FetchTxsFn,
}

/// Retrieves announced transactions
pub trait TxFetcher: Send + Sync {
    fn install(&self, hooks: TxFetcherHooks);

    /// A peer announced pooled transactions by hash
    fn notify(&self, peer: &PeerId, hashes: Vec<Hash>) -> Result<(), FetcherError>;

    /// Full transactions arrived, pushed (`direct`) or as a reply
    fn enqueue(&self, peer: &PeerId, txs: Vec<Transaction>, direct: bool) -> Result<(), FetcherError>;

    fn drop_peer(&self, peer: &PeerId);
}
