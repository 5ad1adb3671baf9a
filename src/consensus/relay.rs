//! Consensus packets and the relay target contract

use crate::consensus::engine::ConsensusError;
use crate::crypto::Hash;
use crate::network::PeerId;
use serde::{Deserialize, Serialize};

/// Out-of-band message of the consensus engine (votes, proposals, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusPacket {
    /// Engine-defined message kind
    pub code: u64,
    pub payload: Vec<u8>,
}

impl ConsensusPacket {
    pub fn new(code: u64, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn hash(&self) -> Hash {
        Hash::digest(&[&self.code.to_be_bytes(), &self.payload])
    }
}

/// Consensus-side consumer of network events and packets
pub trait ConsensusHandler: Send + Sync {
    fn on_peer_connected(&self, peer: &PeerId) -> Result<(), ConsensusError>;

    fn on_peer_disconnected(&self, peer: &PeerId) -> Result<(), ConsensusError>;

    /// Process a packet received from the network
    fn handle_consensus_packet(&self, packet: &ConsensusPacket) -> Result<(), ConsensusError>;

    /// Answer a peer's data request with zero or more packets
    fn handle_request_consensus_data(
        &self,
        packet: &ConsensusPacket,
    ) -> Result<Vec<ConsensusPacket>, ConsensusError>;
}
