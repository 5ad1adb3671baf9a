//! Peer admission and teardown

use super::{Handler, HandlerError};
use super::loops::RelayEvent;
use crate::network::{handshake, Message, Peer, PeerId, RegistryError, HANDSHAKE_TIMEOUT};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl Handler {
    /// Run a peer session on the handler's task tracker
    pub fn spawn_peer(
        self: &Arc<Self>,
        peer: Arc<Peer>,
        inbound: mpsc::Receiver<Message>,
    ) -> JoinHandle<Result<(), HandlerError>> {
        let handler = self.clone();
        self.peer_tasks.spawn(async move {
            let id = peer.id().clone();
            let result = handler.run_eth_peer(peer, inbound).await;
            if let Err(e) = &result {
                log::debug!("Peer {} session ended: {}", id, e);
            }
            result
        })
    }

    /// Admit a peer and serve it until the session ends
    ///
    /// `inbound` yields the messages the wire layer decoded from the
    /// peer. The peer is unregistered on every exit path once it made it
    /// into the registry.
    pub async fn run_eth_peer(
        &self,
        peer: Arc<Peer>,
        mut inbound: mpsc::Receiver<Message>,
    ) -> Result<(), HandlerError> {
        let _tracked = self.peer_tasks.token();

        if !self.chain_sync.handle_peer_event(&peer) {
            return Err(HandlerError::Quitting);
        }
        log::debug!("Peer {} connected (version {})", peer.id(), peer.version());

        let status = self.local_status(peer.version());
        if let Err(e) = handshake(&peer, &mut inbound, status, &self.fork_filter, HANDSHAKE_TIMEOUT).await {
            log::debug!("Handshake with {} failed: {}", peer.id(), e);
            return Err(e.into());
        }

        match self.peers.register_capped(peer.clone(), self.max_peers()) {
            Ok(()) => {}
            Err(RegistryError::Full(_)) => {
                log::debug!("Rejecting {}: too many peers", peer.id());
                return Err(HandlerError::TooManyPeers);
            }
            Err(e) => {
                log::error!("Peer {} registration failed: {}", peer.id(), e);
                return Err(e.into());
            }
        }
        let result = self.serve_registered(&peer, inbound).await;
        self.unregister_peer(peer.id());
        result
    }

    async fn serve_registered(
        &self,
        peer: &Arc<Peer>,
        inbound: mpsc::Receiver<Message>,
    ) -> Result<(), HandlerError> {
        self.notify_relay(RelayEvent::Connected(peer.id().clone()));

        // Banned peers are refused here, after the registry admitted them
        self.downloader.register_peer(peer.clone())?;
        self.chain_sync.handle_peer_event(peer);
        self.sync_transactions(peer);

        let result = async {
            self.challenge_checkpoint(peer).await?;
            for number in self.whitelist.keys() {
                peer.request_headers_by_number(*number, 1).await?;
            }
            self.handle_messages(peer, inbound).await
        }
        .await;

        peer.disarm_challenge();
        result
    }

    /// Ask for the checkpoint header and drop the peer if it never answers
    async fn challenge_checkpoint(&self, peer: &Arc<Peer>) -> Result<(), HandlerError> {
        let Some((number, _)) = self.checkpoint else {
            return Ok(());
        };
        peer.request_headers_by_number(number, 1).await?;

        let timeout = self.challenge_timeout;
        let target = peer.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            log::warn!("Checkpoint challenge timed out, dropping {}", target.id());
            target.disconnect();
        });
        peer.arm_challenge(timer.abort_handle());
        Ok(())
    }

    /// Remove a peer from every component that tracks it
    pub(crate) fn unregister_peer(&self, id: &PeerId) {
        log::debug!("Removing peer {}", id);

        if let Err(e) = self.downloader.unregister_peer(id) {
            log::debug!("Downloader removal of {} failed: {}", id, e);
        }
        self.tx_fetcher.drop_peer(id);

        match self.peers.unregister(id) {
            Ok(peer) => {
                peer.disarm_challenge();
                peer.disconnect();
                self.notify_relay(RelayEvent::Disconnected(id.clone()));
            }
            Err(e) => log::error!("Peer removal failed: {}", e),
        }
    }

    /// Ask a peer session to end; teardown happens in its own task
    pub fn remove_peer(&self, id: &PeerId) {
        if let Some(peer) = self.peers.get(id) {
            peer.disconnect();
        }
    }

    /// Hand a new peer everything pending in the pool
    pub(crate) fn sync_transactions(&self, peer: &Arc<Peer>) {
        let txs: Vec<_> = self
            .tx_pool
            .pending(false)
            .into_values()
            .flatten()
            .collect();
        if txs.is_empty() {
            return;
        }

        if peer.supports_pooled_announcements() {
            let hashes = txs.iter().map(|tx| tx.hash()).collect();
            if let Err(e) = peer.send_pooled_transaction_hashes(hashes) {
                log::debug!("Pending announcement to {} failed: {}", peer.id(), e);
            }
            return;
        }

        let request = super::loops::TxSyncRequest {
            peer: peer.clone(),
            txs,
        };
        if self.txsync_tx.try_send(request).is_err() {
            log::debug!("Transaction sync queue full, skipping {}", peer.id());
        }
    }

    /// Queue a consensus relay notification without blocking the caller
    fn notify_relay(&self, event: RelayEvent) {
        if self.relay_tx.send(event).is_err() {
            log::debug!("Consensus notification queue closed");
        }
    }
}
