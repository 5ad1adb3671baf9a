//! Registry of connected peers
//!
//! Shared by every peer task, the broadcast loops and the snap protocol
//! facade. Peers are kept ordered by id so enumeration is deterministic.

use crate::crypto::Hash;
use crate::network::peer::{Peer, PeerId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Peer {0} already registered")]
    AlreadyRegistered(PeerId),
    #[error("Peer {0} not registered")]
    NotRegistered(PeerId),
    #[error("Peer set closed")]
    Closed,
    #[error("Peer set full ({0} peers)")]
    Full(usize),
}

#[derive(Default)]
struct Inner {
    peers: BTreeMap<PeerId, Arc<Peer>>,
    closed: bool,
}

/// Set of active peer sessions
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<Inner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new peer; fails once the set is closed
    pub fn register(&self, peer: Arc<Peer>) -> Result<(), RegistryError> {
        self.register_capped(peer, usize::MAX)
    }

    /// Add a new peer unless the set already holds `max_peers`
    ///
    /// Trusted peers are admitted regardless of the cap. The size check
    /// and the insert happen under one write lock.
    pub fn register_capped(&self, peer: Arc<Peer>, max_peers: usize) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(RegistryError::Closed);
        }
        if !peer.is_trusted() && inner.peers.len() >= max_peers {
            return Err(RegistryError::Full(inner.peers.len()));
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(RegistryError::AlreadyRegistered(peer.id().clone()));
        }
        log::info!(
            "Added peer: {} (version: {}, trusted: {})",
            peer.id(),
            peer.version(),
            peer.is_trusted()
        );
        inner.peers.insert(peer.id().clone(), peer);
        Ok(())
    }

    /// Remove a peer, returning its session
    pub fn unregister(&self, id: &PeerId) -> Result<Arc<Peer>, RegistryError> {
        let mut inner = self.inner.write();
        match inner.peers.remove(id) {
            Some(peer) => {
                log::info!("Removed peer: {}", id);
                Ok(peer)
            }
            None => Err(RegistryError::NotRegistered(id.clone())),
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).cloned()
    }

    /// All peers, ordered by id
    pub fn all(&self) -> Vec<Arc<Peer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    /// Peers not known to have the given block, ordered by id
    pub fn without_block(&self, hash: &Hash) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_block(hash))
            .cloned()
            .collect()
    }

    /// Peers not known to have the given transaction, ordered by id
    pub fn without_transaction(&self, hash: &Hash) -> Vec<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .filter(|p| !p.knows_transaction(hash))
            .cloned()
            .collect()
    }

    /// Peer advertising the highest total difficulty
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        self.inner
            .read()
            .peers
            .values()
            .max_by_key(|p| p.head().1)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnect every peer and reject further registrations
    pub fn close(&self) {
        let mut inner = self.inner.write();
        for peer in inner.peers.values() {
            peer.disconnect();
        }
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}
