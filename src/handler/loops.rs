//! Background broadcast loops

use super::Handler;
use crate::core::{NewMinedBlockEvent, NewTxsEvent, Transaction};
use crate::network::{Message, Peer, PeerId};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Soft byte limit of one legacy transaction sync pack
pub const TX_SYNC_PACK_SIZE: usize = 100 * 1024;

/// Pending transactions to stream to a peer without pooled announcements
pub(crate) struct TxSyncRequest {
    pub peer: Arc<Peer>,
    pub txs: Vec<Transaction>,
}

/// Consensus relay notification about a peer
pub(crate) enum RelayEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

impl Handler {
    /// Deliver peer notifications to the consensus relay target in order
    ///
    /// Runs until `relay_quit` fires, then flushes what is still queued.
    pub(crate) async fn relay_notify_loop(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.deliver_relay_event(event),
                    None => break,
                },
                _ = self.relay_quit.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        self.deliver_relay_event(event);
                    }
                    break;
                }
            }
        }
        log::debug!("Consensus notification loop stopped");
    }

    fn deliver_relay_event(&self, event: RelayEvent) {
        let (id, result) = match event {
            RelayEvent::Connected(id) => {
                let result = self.consensus.on_peer_connected(&id);
                (id, result)
            }
            RelayEvent::Disconnected(id) => {
                let result = self.consensus.on_peer_disconnected(&id);
                (id, result)
            }
        };
        if let Err(e) = result {
            log::warn!("Consensus notification for {} failed: {}", id, e);
        }
    }

    /// Propagate transactions newly accepted into the pool
    pub(crate) async fn tx_broadcast_loop(self: Arc<Self>, mut events: broadcast::Receiver<NewTxsEvent>) {
        loop {
            tokio::select! {
                _ = self.tx_sub.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.broadcaster.broadcast_transactions(&event.txs),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Transaction broadcast lagged, skipped {} event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("Transaction broadcast loop stopped");
    }

    /// Propagate locally mined blocks, then announce them
    pub(crate) async fn mined_broadcast_loop(
        self: Arc<Self>,
        mut events: broadcast::Receiver<NewMinedBlockEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.mined_sub.cancelled() => break,
                event = events.recv() => match event {
                    Ok(NewMinedBlockEvent { block }) => {
                        self.broadcaster.broadcast_block(&block, true);
                        self.broadcaster.broadcast_block(&block, false);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Mined block broadcast lagged, skipped {} event(s)", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        log::debug!("Mined block broadcast loop stopped");
    }

    /// Stream pending transactions to legacy peers one pack at a time
    pub(crate) async fn tx_sync_loop(self: Arc<Self>, mut requests: mpsc::Receiver<TxSyncRequest>) {
        loop {
            let request = tokio::select! {
                _ = self.quit.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let TxSyncRequest { peer, txs } = request;
            let mut remaining = txs.as_slice();
            while !remaining.is_empty() {
                let (pack, rest) = split_pack(remaining);
                remaining = rest;
                let pack: Vec<Transaction> = pack
                    .iter()
                    .filter(|tx| !peer.knows_transaction(&tx.hash()))
                    .cloned()
                    .collect();
                if pack.is_empty() {
                    continue;
                }
                let hashes: Vec<_> = pack.iter().map(Transaction::hash).collect();
                let count = pack.len();

                let sent = tokio::select! {
                    _ = self.quit.cancelled() => return,
                    _ = peer.closed() => break,
                    sent = peer.send(Message::Transactions(pack)) => sent,
                };
                match sent {
                    Ok(()) => {
                        for hash in hashes {
                            peer.mark_transaction(hash);
                        }
                        log::trace!("Sent {} pending transaction(s) to {}", count, peer.id());
                    }
                    Err(e) => {
                        log::debug!("Transaction sync with {} failed: {}", peer.id(), e);
                        break;
                    }
                }
            }
        }
        log::debug!("Transaction sync loop stopped");
    }
}

/// Split off the next pack, at least one transaction long
fn split_pack(txs: &[Transaction]) -> (&[Transaction], &[Transaction]) {
    let mut size = 0;
    let mut end = 0;
    for tx in txs {
        if end > 0 && size + tx.size() > TX_SYNC_PACK_SIZE {
            break;
        }
        size += tx.size();
        end += 1;
    }
    txs.split_at(end)
}
