//! Snapshot protocol facade
//!
//! Shares the handler's peer registry; snapshot packets themselves are
//! consumed by the downloader.

use crate::network::{Peer, PeerId, PeerSet, SnapPacket};
use crate::sync::{ChainDownloader, DownloaderError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Public view of a peer's snapshot extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapPeerInfo {
    pub version: u32,
}

/// Snapshot protocol handler
#[derive(Clone)]
pub struct SnapHandler {
    peers: Arc<PeerSet>,
    downloader: Arc<dyn ChainDownloader>,
}

impl SnapHandler {
    pub fn new(peers: Arc<PeerSet>, downloader: Arc<dyn ChainDownloader>) -> Self {
        Self { peers, downloader }
    }

    /// Snapshot metadata of a registered peer, if it negotiated the extension
    pub fn peer_info(&self, id: &PeerId) -> Option<SnapPeerInfo> {
        let snap = self.peers.get(id)?.snap()?;
        Some(SnapPeerInfo {
            version: snap.version,
        })
    }

    /// Route an inbound snapshot packet to the downloader
    pub fn handle(&self, peer: &Peer, packet: SnapPacket) -> Result<(), DownloaderError> {
        log::trace!(
            "Snap packet {} (request {}) from {}",
            packet.code,
            packet.request_id,
            peer.id()
        );
        self.downloader.deliver_snap_packet(peer.id(), packet)
    }
}
