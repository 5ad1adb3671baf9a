//! Block and header types
//!
//! Only the fields the synchronization layer reads are modelled: the
//! parent link, height, difficulty and the carried transactions.

use crate::core::transaction::Transaction;
use crate::crypto::Hash;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Hash of the parent block
    pub parent_hash: Hash,
    /// Block height; `None` for a malformed header received off the wire
    pub number: Option<u64>,
    /// Difficulty of this block alone
    pub difficulty: u128,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Root over the carried transaction hashes
    pub tx_root: Hash,
    /// Seal data filled in by the consensus engine
    pub extra: Vec<u8>,
}

impl Header {
    pub fn new(parent_hash: Hash, number: u64, difficulty: u128) -> Self {
        Self {
            parent_hash,
            number: Some(number),
            difficulty,
            timestamp: Utc::now().timestamp(),
            tx_root: Hash::ZERO,
            extra: Vec::new(),
        }
    }

    /// Calculate the hash of the header
    pub fn hash(&self) -> Hash {
        let number = self.number.map(u64::to_be_bytes).unwrap_or_default();
        Hash::digest(&[
            self.parent_hash.as_bytes(),
            &number,
            &self.difficulty.to_be_bytes(),
            &self.timestamp.to_be_bytes(),
            self.tx_root.as_bytes(),
            &self.extra,
        ])
    }
}

/// A block: header plus body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    /// Block hash (cached for efficiency)
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: Header, transactions: Vec<Transaction>) -> Self {
        let mut header = header;
        header.tx_root = Self::calculate_tx_root(&transactions);
        let hash = header.hash();
        Self {
            header,
            hash,
            transactions,
        }
    }

    /// Genesis block for a given network identifier
    pub fn genesis(network_id: u64) -> Self {
        let mut header = Header::new(Hash::ZERO, 0, 1);
        header.timestamp = 0;
        header.extra = network_id.to_be_bytes().to_vec();
        Self::new(header, Vec::new())
    }

    /// Height of the block, zero when the header carries none
    pub fn number(&self) -> u64 {
        self.header.number.unwrap_or_default()
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn difficulty(&self) -> u128 {
        self.header.difficulty
    }

    fn calculate_tx_root(transactions: &[Transaction]) -> Hash {
        if transactions.is_empty() {
            return Hash::ZERO;
        }
        let hashes: Vec<Hash> = transactions.iter().map(Transaction::hash).collect();
        let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_bytes().as_slice()).collect();
        Hash::digest(&parts)
    }
}
