//! Protocol handshake
//!
//! Both sides send a `Status` first. The remote one must agree on network,
//! genesis and protocol version and pass the fork identity filter.

use crate::core::{ForkFilter, ForkIdError};
use crate::crypto::Hash;
use crate::network::message::{Message, Status};
use crate::network::peer::{Peer, PeerError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Time allowed for the remote status to arrive
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandshakeError {
    #[error("Handshake timed out")]
    Timeout,
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Expected Status, got {0}")]
    UnexpectedMessage(&'static str),
    #[error("Network id mismatch: {theirs} (!= {ours})")]
    NetworkIdMismatch { ours: u64, theirs: u64 },
    #[error("Genesis mismatch: {theirs} (!= {ours})")]
    GenesisMismatch { ours: Hash, theirs: Hash },
    #[error("Protocol version mismatch: {theirs} (!= {ours})")]
    ProtocolVersionMismatch { ours: u32, theirs: u32 },
    #[error("Fork id rejected: {0}")]
    ForkId(#[from] ForkIdError),
}

/// Exchange status with the peer and validate its reply
pub async fn handshake(
    peer: &Peer,
    inbound: &mut mpsc::Receiver<Message>,
    ours: Status,
    filter: &ForkFilter,
    timeout: Duration,
) -> Result<Status, HandshakeError> {
    peer.send(Message::Status(ours.clone())).await?;

    let theirs = match tokio::time::timeout(timeout, inbound.recv()).await {
        Err(_) => return Err(HandshakeError::Timeout),
        Ok(None) => return Err(HandshakeError::Peer(PeerError::Disconnected)),
        Ok(Some(Message::Status(status))) => status,
        Ok(Some(other)) => return Err(HandshakeError::UnexpectedMessage(other.type_name())),
    };

    if theirs.network_id != ours.network_id {
        return Err(HandshakeError::NetworkIdMismatch {
            ours: ours.network_id,
            theirs: theirs.network_id,
        });
    }
    if theirs.genesis != ours.genesis {
        return Err(HandshakeError::GenesisMismatch {
            ours: ours.genesis,
            theirs: theirs.genesis,
        });
    }
    if theirs.protocol_version != peer.version() {
        return Err(HandshakeError::ProtocolVersionMismatch {
            ours: peer.version(),
            theirs: theirs.protocol_version,
        });
    }
    filter.validate(&theirs.fork_id)?;

    peer.set_head(theirs.head, theirs.td);
    log::debug!(
        "Handshake with {} complete: td={}, head={}",
        peer.id(),
        theirs.td,
        theirs.head.short()
    );
    Ok(theirs)
}
