//! Transaction pool contract

use crate::core::events::NewTxsEvent;
use crate::core::transaction::Transaction;
use crate::crypto::Hash;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

/// Pool admission errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Transaction already known")]
    AlreadyKnown,
    #[error("Transaction underpriced: tip {0}")]
    Underpriced(u64),
    #[error("Invalid transaction: {0}")]
    Invalid(String),
}

/// Pending transaction pool
pub trait TxPool: Send + Sync {
    fn has(&self, hash: &Hash) -> bool;

    fn get(&self, hash: &Hash) -> Option<Transaction>;

    /// Add transactions received from the network, one result per input
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), PoolError>>;

    /// Executable transactions grouped by sender, nonce ordered
    fn pending(&self, enforce_tips: bool) -> BTreeMap<String, Vec<Transaction>>;

    /// Subscribe to transactions newly accepted into the pool
    fn subscribe_new_txs(&self) -> broadcast::Receiver<NewTxsEvent>;
}
