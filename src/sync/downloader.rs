//! Long-range chain downloader contract
//!
//! The downloader internals live outside this crate. The handler installs
//! hooks into it at construction and drives it per peer and per sync cycle.

use crate::core::Header;
use crate::crypto::Hash;
use crate::network::{Peer, PeerId, SnapPacket};
use crate::sync::bloom::StateBloom;
use crate::sync::mode::SyncMode;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Downloader errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DownloaderError {
    #[error("Peer {0} is banned")]
    Banned(PeerId),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("Sync already in progress")]
    Busy,
    #[error("Sync failed: {0}")]
    Failed(String),
}

/// Reads the current local chain height
pub type HeightFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Drops a misbehaving peer
pub type DropPeerFn = Arc<dyn Fn(&PeerId) + Send + Sync>;

/// Callbacks the handler installs into the downloader
#[derive(Clone)]
pub struct DownloaderHooks {
    pub height: HeightFn,
    pub drop_peer: DropPeerFn,
    /// Present only for fast sync without snap sync
    pub state_bloom: Option<Arc<StateBloom>>,
}

/// Long-range block and state retrieval
#[async_trait]
pub trait ChainDownloader: Send + Sync {
    fn install(&self, hooks: DownloaderHooks);

    /// Start tracking a peer; fails with `Banned` for rejected peers
    fn register_peer(&self, peer: Arc<Peer>) -> Result<(), DownloaderError>;

    fn unregister_peer(&self, id: &PeerId) -> Result<(), DownloaderError>;

    /// Sync the local chain against the given peer's head
    async fn synchronise(
        &self,
        id: &PeerId,
        head: Hash,
        td: u128,
        mode: SyncMode,
    ) -> Result<(), DownloaderError>;

    /// Hand over headers the peer sent in reply to a request
    fn deliver_headers(&self, id: &PeerId, headers: Vec<Header>) -> Result<(), DownloaderError>;

    /// Hand over a snapshot protocol packet
    fn deliver_snap_packet(&self, id: &PeerId, packet: SnapPacket) -> Result<(), DownloaderError>;
}
