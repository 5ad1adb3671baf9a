//! Block, transaction and consensus data propagation
//!
//! Full payloads go directly to a square-root subset of the eligible
//! peers; the rest get a hash-only announcement and pull the body on
//! demand. Peer order comes from the registry, so the split is
//! reproducible for a given registry state.

use crate::consensus::ConsensusPacket;
use crate::core::{Block, Chain, Transaction};
use crate::crypto::Hash;
use crate::network::message::{BlockAnnouncement, Message};
use crate::network::peer::{Peer, PeerId};
use crate::network::peerset::PeerSet;
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Number of peers receiving a full payload out of `n` eligible ones
pub fn fanout(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut root = (n as f64).sqrt() as usize;
    // Correct float rounding in either direction
    while root * root > n {
        root -= 1;
    }
    while root * root < n {
        root += 1;
    }
    root
}

/// Transactions queued for one peer
#[derive(Debug, Clone)]
pub struct PeerBatch {
    pub peer: Arc<Peer>,
    pub txs: Vec<Transaction>,
}

/// Per-peer split of a transaction batch
#[derive(Debug, Default)]
pub struct TxFanout {
    /// Peers receiving full transactions
    pub direct: BTreeMap<PeerId, PeerBatch>,
    /// Peers receiving hash announcements
    pub announce: BTreeMap<PeerId, PeerBatch>,
}

impl TxFanout {
    fn add(map: &mut BTreeMap<PeerId, PeerBatch>, peer: &Arc<Peer>, tx: &Transaction) {
        map.entry(peer.id().clone())
            .or_insert_with(|| PeerBatch {
                peer: peer.clone(),
                txs: Vec::new(),
            })
            .txs
            .push(tx.clone());
    }

    /// Hashes per peer for the direct and announce sides
    #[allow(clippy::type_complexity)]
    pub fn hashes(&self) -> (BTreeMap<PeerId, Vec<Hash>>, BTreeMap<PeerId, Vec<Hash>>) {
        let collect = |map: &BTreeMap<PeerId, PeerBatch>| {
            map.iter()
                .map(|(id, batch)| (id.clone(), batch.txs.iter().map(Transaction::hash).collect()))
                .collect()
        };
        (collect(&self.direct), collect(&self.announce))
    }
}

/// Propagates data to the peer set
pub struct Broadcaster {
    peers: Arc<PeerSet>,
    chain: Arc<dyn Chain>,
}

impl Broadcaster {
    pub fn new(peers: Arc<PeerSet>, chain: Arc<dyn Chain>) -> Self {
        Self { peers, chain }
    }

    /// Propagate a block: the full block to a subset of peers when
    /// `propagate` is set, otherwise a hash announcement to all of them
    pub fn broadcast_block(&self, block: &Block, propagate: bool) {
        let hash = block.hash;
        let peers = self.peers.without_block(&hash);

        if propagate {
            // The block is not committed yet, so its weight is the parent's
            // total difficulty plus its own
            let parent_td = match block.header.number {
                Some(number) if number > 0 => self
                    .chain
                    .total_difficulty(&block.parent_hash(), number - 1),
                _ => None,
            };
            let td = match parent_td {
                Some(td) => td + block.difficulty(),
                None => {
                    log::error!(
                        "Propagating dangling block {} ({})",
                        block.number(),
                        hash.short()
                    );
                    return;
                }
            };

            let direct = fanout(peers.len());
            for peer in &peers[..direct] {
                if let Err(e) = peer.send_new_block(block, td) {
                    log::debug!("Failed to send block {} to {}: {}", hash.short(), peer.id(), e);
                }
            }
            log::trace!(
                "Propagated block {} ({}) to {} of {} peers",
                block.number(),
                hash.short(),
                direct,
                peers.len()
            );
            return;
        }

        if !self.chain.has_block(&hash, block.number()) {
            return;
        }
        let announcement = BlockAnnouncement {
            hash,
            number: block.number(),
        };
        for peer in &peers {
            if let Err(e) = peer.send_new_block_hashes(vec![announcement]) {
                log::debug!("Failed to announce block {} to {}: {}", hash.short(), peer.id(), e);
            }
        }
        log::trace!(
            "Announced block {} ({}) to {} peers",
            block.number(),
            hash.short(),
            peers.len()
        );
    }

    /// Compute the direct/announce split without sending anything
    pub fn plan_transactions(&self, txs: &[Transaction]) -> TxFanout {
        let mut plan = TxFanout::default();
        for tx in txs {
            let peers = self.peers.without_transaction(&tx.hash());
            let direct = fanout(peers.len());
            for peer in &peers[..direct] {
                TxFanout::add(&mut plan.direct, peer, tx);
            }
            for peer in &peers[direct..] {
                TxFanout::add(&mut plan.announce, peer, tx);
            }
        }
        plan
    }

    /// Propagate transactions, one combined message per peer and side
    pub fn broadcast_transactions(&self, txs: &[Transaction]) {
        let plan = self.plan_transactions(txs);
        let (direct_peers, announce_peers) = (plan.direct.len(), plan.announce.len());

        for (id, batch) in plan.direct {
            let count = batch.txs.len();
            if let Err(e) = batch.peer.send_transactions(batch.txs) {
                log::debug!("Failed to send {} transactions to {}: {}", count, id, e);
            }
        }
        for (id, batch) in plan.announce {
            let count = batch.txs.len();
            let result = if batch.peer.supports_pooled_announcements() {
                let hashes = batch.txs.iter().map(Transaction::hash).collect();
                batch.peer.send_pooled_transaction_hashes(hashes)
            } else {
                batch.peer.send_transactions(batch.txs)
            };
            if let Err(e) = result {
                log::debug!("Failed to announce {} transactions to {}: {}", count, id, e);
            }
        }
        log::trace!(
            "Broadcast {} transactions: {} direct peers, {} announce peers",
            txs.len(),
            direct_peers,
            announce_peers
        );
    }

    /// Ask a subset of peers for pooled transactions
    pub fn request_transactions(&self, hashes: &[Hash]) {
        if hashes.is_empty() {
            return;
        }
        let peers = self.peers.all();
        for peer in &peers[..fanout(peers.len())] {
            if let Err(e) = peer.request_transactions(hashes.to_vec()) {
                log::debug!("Failed to request transactions from {}: {}", peer.id(), e);
            }
        }
    }

    /// Send a consensus packet to every peer
    pub fn broadcast_consensus_data(&self, packet: &ConsensusPacket) {
        let peers = self.peers.all();
        for peer in &peers {
            if let Err(e) = peer.queue(Message::ConsensusPacket(packet.clone())) {
                log::debug!("Failed to send consensus packet to {}: {}", peer.id(), e);
            }
        }
        log::trace!(
            "Broadcast consensus packet {} to {} peers",
            packet.hash().short(),
            peers.len()
        );
    }

    /// Send a consensus data request to a subset of peers
    pub fn request_consensus_data(&self, packet: &ConsensusPacket) {
        let peers = self.peers.all();
        for peer in &peers[..fanout(peers.len())] {
            if let Err(e) = peer.queue(Message::RequestConsensusData(packet.clone())) {
                log::debug!("Failed to request consensus data from {}: {}", peer.id(), e);
            }
        }
    }

    /// Relay a received consensus packet to up to `limit` other peers
    /// (every other peer when `limit` is zero)
    pub fn relay_consensus_data(&self, packet: &ConsensusPacket, from: &PeerId, limit: usize) -> usize {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .all()
            .into_iter()
            .filter(|p| p.id() != from)
            .collect();
        if limit > 0 && peers.len() > limit {
            peers.shuffle(&mut rand::thread_rng());
            peers.truncate(limit);
        }
        let mut relayed = 0;
        for peer in &peers {
            match peer.queue(Message::ConsensusPacket(packet.clone())) {
                Ok(()) => relayed += 1,
                Err(e) => log::debug!("Failed to relay consensus packet to {}: {}", peer.id(), e),
            }
        }
        relayed
    }
}
