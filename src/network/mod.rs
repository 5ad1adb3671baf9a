//! P2P networking primitives
//!
//! Provides the pieces the protocol handler orchestrates.
//!
//! # Features
//! - Decoded protocol messages and the status handshake
//! - Peer sessions with bounded known-hash caches
//! - A shared, ordered peer registry
//! - Square-root fan-out block/transaction propagation

pub mod broadcast;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod peerset;

pub use broadcast::{fanout, Broadcaster, PeerBatch, TxFanout};
pub use handshake::{handshake, HandshakeError, HANDSHAKE_TIMEOUT};
pub use message::{
    BlockAnnouncement, HashOrNumber, Message, SnapPacket, Status, ETH64, ETH65, ETH66,
    PROTOCOL_VERSIONS,
};
pub use peer::{
    Peer, PeerError, PeerId, PeerInfo, SnapExtension, MAX_KNOWN_BLOCKS, MAX_KNOWN_TXS,
    MAX_QUEUED_MESSAGES,
};
pub use peerset::{PeerSet, RegistryError};
