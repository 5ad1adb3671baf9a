//! Transactions as seen by the propagation layer
//!
//! The pool decides validity; gossip only needs identity, sender
//! ordering and an approximate encoded size.

use crate::crypto::Hash;
use serde::{Deserialize, Serialize};

/// Fixed per-transaction overhead counted on top of the payload size
const TX_OVERHEAD: usize = 64;

/// A pending transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender account
    pub sender: String,
    /// Sender-local sequence number
    pub nonce: u64,
    /// Priority fee offered to the block producer
    pub tip: u64,
    /// Opaque call data
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(sender: &str, nonce: u64, payload: Vec<u8>) -> Self {
        Self {
            sender: sender.to_string(),
            nonce,
            tip: 0,
            payload,
        }
    }

    pub fn with_tip(mut self, tip: u64) -> Self {
        self.tip = tip;
        self
    }

    /// Transaction identifier
    pub fn hash(&self) -> Hash {
        Hash::digest(&[
            self.sender.as_bytes(),
            &self.nonce.to_be_bytes(),
            &self.tip.to_be_bytes(),
            &self.payload,
        ])
    }

    /// Approximate encoded size in bytes
    pub fn size(&self) -> usize {
        TX_OVERHEAD + self.sender.len() + self.payload.len()
    }
}
