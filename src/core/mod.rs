//! Core ledger types and the contracts the synchronization layer consumes
//!
//! This module contains:
//! - Blocks, headers and transactions
//! - Fork identity and its handshake filter
//! - Node events (new pool transactions, mined blocks)
//! - The `Chain` and `TxPool` collaborator traits

pub mod block;
pub mod chain;
pub mod events;
pub mod forkid;
pub mod transaction;
pub mod txpool;

pub use block::{Block, Header};
pub use chain::{Chain, ChainError};
pub use events::{EventMux, NewMinedBlockEvent, NewTxsEvent};
pub use forkid::{ForkFilter, ForkId, ForkIdError};
pub use transaction::Transaction;
pub use txpool::{PoolError, TxPool};
