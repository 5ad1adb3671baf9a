//! Network message types for the block/transaction/consensus protocol
//!
//! Byte-level encoding belongs to the wire layer; these are the decoded
//! messages it hands to the handler and accepts back for sending.

use crate::consensus::ConsensusPacket;
use crate::core::{Block, ForkId, Header, Transaction};
use crate::crypto::Hash;
use serde::{Deserialize, Serialize};

/// Oldest supported protocol version
pub const ETH64: u32 = 64;

/// First version with pooled transaction hash announcements
pub const ETH65: u32 = 65;

/// First version with request identifiers
pub const ETH66: u32 = 66;

/// Supported protocol versions, newest first
pub const PROTOCOL_VERSIONS: [u32; 3] = [ETH66, ETH65, ETH64];

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Handshake status, exchanged once when connecting
    Status(Status),

    /// Announce blocks by hash
    NewBlockHashes(Vec<BlockAnnouncement>),

    /// Propagate a full block with the chain's total difficulty
    NewBlock { block: Block, td: u128 },

    /// Push full transactions
    Transactions(Vec<Transaction>),

    /// Announce pooled transactions by hash
    NewPooledTransactionHashes(Vec<Hash>),

    /// Request pooled transactions by hash
    GetPooledTransactions(Vec<Hash>),

    /// Response with requested pooled transactions
    PooledTransactions(Vec<Transaction>),

    /// Request a header range
    GetBlockHeaders { origin: HashOrNumber, amount: u64 },

    /// Response with headers
    BlockHeaders(Vec<Header>),

    /// Out-of-band consensus message
    ConsensusPacket(ConsensusPacket),

    /// Ask the consensus layer of a peer for data
    RequestConsensusData(ConsensusPacket),

    /// Snapshot protocol traffic carried for the downloader
    Snap(SnapPacket),
}

/// Handshake status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    /// Total difficulty of the sender's head
    pub td: u128,
    pub head: Hash,
    pub genesis: Hash,
    pub fork_id: ForkId,
}

/// Block announcement entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnnouncement {
    pub hash: Hash,
    pub number: u64,
}

/// Origin of a header request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashOrNumber {
    Hash(Hash),
    Number(u64),
}

/// Snapshot protocol packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapPacket {
    pub code: u64,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

impl Message {
    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Status(_) => "Status",
            Message::NewBlockHashes(_) => "NewBlockHashes",
            Message::NewBlock { .. } => "NewBlock",
            Message::Transactions(_) => "Transactions",
            Message::NewPooledTransactionHashes(_) => "NewPooledTransactionHashes",
            Message::GetPooledTransactions(_) => "GetPooledTransactions",
            Message::PooledTransactions(_) => "PooledTransactions",
            Message::GetBlockHeaders { .. } => "GetBlockHeaders",
            Message::BlockHeaders(_) => "BlockHeaders",
            Message::ConsensusPacket(_) => "ConsensusPacket",
            Message::RequestConsensusData(_) => "RequestConsensusData",
            Message::Snap(_) => "Snap",
        }
    }
}
