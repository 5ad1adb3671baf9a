//! Inbound message dispatch

use super::{Handler, HandlerError};
use crate::consensus::ConsensusPacket;
use crate::core::{Block, Header, Transaction};
use crate::crypto::Hash;
use crate::network::{HashOrNumber, Message, Peer};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Maximum headers served per request
pub const MAX_HEADERS_SERVE: u64 = 1024;

/// Maximum transactions served per pooled transaction request
pub const MAX_TXS_SERVE: usize = 256;

impl Handler {
    /// Read messages until the peer disconnects or misbehaves
    pub(crate) async fn handle_messages(
        &self,
        peer: &Arc<Peer>,
        mut inbound: mpsc::Receiver<Message>,
    ) -> Result<(), HandlerError> {
        loop {
            let msg = tokio::select! {
                _ = peer.closed() => return Err(HandlerError::Disconnected),
                msg = inbound.recv() => msg,
            };
            let Some(msg) = msg else {
                return Ok(());
            };
            if let Err(e) = self.handle_message(peer, msg).await {
                log::debug!("Message handling failed for {}: {}", peer.id(), e);
                return Err(e);
            }
        }
    }

    /// Dispatch one inbound message
    pub async fn handle_message(&self, peer: &Arc<Peer>, msg: Message) -> Result<(), HandlerError> {
        log::trace!("Received {} from {}", msg.type_name(), peer.id());

        match msg {
            Message::Status(_) => Err(HandlerError::UnexpectedMessage("Status")),

            Message::NewBlockHashes(announcements) => {
                for announcement in announcements {
                    peer.mark_block(announcement.hash);
                    if let Err(e) = self.block_fetcher.notify(peer.id(), announcement) {
                        log::debug!("Block announcement from {} dropped: {}", peer.id(), e);
                    }
                }
                Ok(())
            }

            Message::NewBlock { block, td } => self.handle_new_block(peer, block, td),

            Message::Transactions(txs) => {
                self.handle_transactions(peer, txs, true);
                Ok(())
            }

            Message::PooledTransactions(txs) => {
                self.handle_transactions(peer, txs, false);
                Ok(())
            }

            Message::NewPooledTransactionHashes(hashes) => {
                if !self.state.accepts_txs() {
                    return Ok(());
                }
                for hash in &hashes {
                    peer.mark_transaction(*hash);
                }
                if let Err(e) = self.tx_fetcher.notify(peer.id(), hashes) {
                    log::debug!("Transaction announcement from {} dropped: {}", peer.id(), e);
                }
                Ok(())
            }

            Message::GetPooledTransactions(hashes) => {
                let txs: Vec<Transaction> = hashes
                    .iter()
                    .filter_map(|hash| self.tx_pool.get(hash))
                    .take(MAX_TXS_SERVE)
                    .collect();
                peer.send(Message::PooledTransactions(txs)).await?;
                Ok(())
            }

            Message::GetBlockHeaders { origin, amount } => {
                let headers = self.serve_headers(origin, amount);
                peer.send(Message::BlockHeaders(headers)).await?;
                Ok(())
            }

            Message::BlockHeaders(headers) => self.handle_block_headers(peer, headers),

            Message::ConsensusPacket(packet) => {
                self.handle_consensus_packet(peer, packet);
                Ok(())
            }

            Message::RequestConsensusData(packet) => {
                match self.consensus.handle_request_consensus_data(&packet) {
                    Ok(replies) => {
                        for reply in replies {
                            peer.send(Message::ConsensusPacket(reply)).await?;
                        }
                    }
                    Err(e) => log::debug!("Consensus data request from {} failed: {}", peer.id(), e),
                }
                Ok(())
            }

            Message::Snap(packet) => {
                if peer.snap().is_none() {
                    return Err(HandlerError::UnexpectedMessage("Snap"));
                }
                if let Err(e) = self.snap_handler().handle(peer, packet) {
                    log::debug!("Snap packet from {} rejected: {}", peer.id(), e);
                }
                Ok(())
            }
        }
    }

    fn handle_new_block(&self, peer: &Arc<Peer>, block: Block, td: u128) -> Result<(), HandlerError> {
        if block.header.number.is_none() {
            return Err(HandlerError::InvalidBlock(format!(
                "block {} has no number",
                block.hash.short()
            )));
        }
        peer.mark_block(block.hash);

        // The sender's head is the parent; this block is not imported yet
        let parent = block.parent_hash();
        let parent_td = td.saturating_sub(block.difficulty());

        if let Err(e) = self.block_fetcher.enqueue(peer.id(), block) {
            log::debug!("Propagated block from {} dropped: {}", peer.id(), e);
        }

        let (_, known_td) = peer.head();
        if parent_td > known_td {
            peer.set_head(parent, parent_td);
            self.chain_sync.handle_peer_event(peer);
        }
        Ok(())
    }

    fn handle_transactions(&self, peer: &Arc<Peer>, txs: Vec<Transaction>, direct: bool) {
        if !self.state.accepts_txs() {
            log::trace!("Ignoring {} transaction(s) from {} while syncing", txs.len(), peer.id());
            return;
        }
        for tx in &txs {
            peer.mark_transaction(tx.hash());
        }
        if let Err(e) = self.tx_fetcher.enqueue(peer.id(), txs, direct) {
            log::debug!("Transactions from {} dropped: {}", peer.id(), e);
        }
    }

    fn handle_block_headers(&self, peer: &Arc<Peer>, headers: Vec<Header>) -> Result<(), HandlerError> {
        if headers.is_empty() && peer.disarm_challenge() {
            // A syncing node must not accept peers that withhold the checkpoint
            if self.state.is_fast_syncing() {
                log::warn!("Dropping unsynced node {} during sync", peer.id());
                self.remove_peer(peer.id());
            }
            return Ok(());
        }

        // Headers without a number are left for the downloader to reject
        if let [header @ Header { number: Some(number), .. }] = headers.as_slice() {
            let number = *number;

            if let Some((checkpoint, expected)) = self.checkpoint {
                if number == checkpoint && peer.disarm_challenge() {
                    if header.hash() != expected {
                        log::info!("Checkpoint mismatch from {}, dropping", peer.id());
                        return Err(HandlerError::CheckpointMismatch);
                    }
                    log::debug!("Checkpoint challenge passed by {}", peer.id());
                    return Ok(());
                }
            }

            if let Some(expected) = self.whitelist.get(&number) {
                if header.hash() != *expected {
                    log::info!("Whitelist mismatch at {} from {}, dropping", number, peer.id());
                    return Err(HandlerError::WhitelistMismatch(number));
                }
                log::debug!("Whitelist block {} verified for {}", number, peer.id());
            }
        }

        if let Err(e) = self.downloader.deliver_headers(peer.id(), headers) {
            log::debug!("Header delivery from {} failed: {}", peer.id(), e);
        }
        Ok(())
    }

    /// Collect consecutive headers starting at `origin`
    pub(crate) fn serve_headers(&self, origin: HashOrNumber, amount: u64) -> Vec<Header> {
        let start = match origin {
            HashOrNumber::Number(number) => Some(number),
            HashOrNumber::Hash(hash) => self.chain.block_by_hash(&hash).map(|b| b.number()),
        };
        let Some(start) = start else {
            return Vec::new();
        };

        (start..start.saturating_add(amount.min(MAX_HEADERS_SERVE)))
            .map_while(|number| self.chain.header_by_number(number))
            .collect()
    }

    /// Hand a consensus packet to the engine and relay it once
    fn handle_consensus_packet(&self, peer: &Arc<Peer>, packet: ConsensusPacket) {
        let hash: Hash = packet.hash();
        if !self.rebroadcast.observe(hash) {
            log::trace!("Suppressed duplicate consensus packet {} from {}", hash.short(), peer.id());
            return;
        }
        if let Err(e) = self.consensus.handle_consensus_packet(&packet) {
            log::debug!("Consensus packet from {} rejected: {}", peer.id(), e);
            return;
        }
        let relayed = self
            .broadcaster
            .relay_consensus_data(&packet, peer.id(), self.rebroadcast_fanout);
        log::trace!("Relayed consensus packet {} to {} peer(s)", hash.short(), relayed);
    }
}
