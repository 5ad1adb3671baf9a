//! Local chain contract
//!
//! The storage engine and chain reorganization live elsewhere; the
//! synchronization layer reads heads and difficulties and feeds
//! propagated blocks in through `insert_chain`.

use crate::consensus::ConsensusEngine;
use crate::core::block::{Block, Header};
use crate::crypto::Hash;
use std::sync::Arc;
use thiserror::Error;

/// Chain insertion errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("Unknown parent {parent} for block {number}")]
    UnknownParent { number: u64, parent: Hash },
    #[error("Invalid block at index {index}: {reason}")]
    InvalidBlock { index: usize, reason: String },
}

/// Read and insert access to the local ledger
pub trait Chain: Send + Sync {
    /// Head of the fully processed chain
    fn current_block(&self) -> Block;

    /// Height of the fully processed chain
    fn current_height(&self) -> u64 {
        self.current_block().number()
    }

    /// Height of the header/body chain a fast sync has reached
    fn current_fast_height(&self) -> u64;

    fn block_by_hash(&self, hash: &Hash) -> Option<Block>;

    fn block_by_number(&self, number: u64) -> Option<Block>;

    fn header_by_number(&self, number: u64) -> Option<Header> {
        self.block_by_number(number).map(|b| b.header)
    }

    fn header(&self, hash: &Hash, number: u64) -> Option<Header>;

    /// Total difficulty of the chain ending at the given block
    fn total_difficulty(&self, hash: &Hash, number: u64) -> Option<u128>;

    fn has_block(&self, hash: &Hash, number: u64) -> bool;

    /// Insert a batch of blocks, returning how many were imported
    fn insert_chain(&self, blocks: Vec<Block>) -> Result<usize, ChainError>;

    fn engine(&self) -> Arc<dyn ConsensusEngine>;

    /// Scheduled protocol upgrade heights, used for the fork identity
    fn fork_blocks(&self) -> Vec<u64>;

    fn genesis_hash(&self) -> Hash;
}
