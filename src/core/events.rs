//! Node-internal events the handler reacts to

use crate::core::block::Block;
use crate::core::transaction::Transaction;
use tokio::sync::broadcast;

/// Capacity of the default event multiplexer
const EVENT_MUX_CAPACITY: usize = 256;

/// Transactions newly accepted into the pool
#[derive(Debug, Clone)]
pub struct NewTxsEvent {
    pub txs: Vec<Transaction>,
}

/// A block sealed by the local producer
#[derive(Debug, Clone)]
pub struct NewMinedBlockEvent {
    pub block: Block,
}

/// Fan-out of mined block events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventMux {
    tx: broadcast::Sender<NewMinedBlockEvent>,
}

impl EventMux {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_MUX_CAPACITY);
        Self { tx }
    }

    /// Post a mined block; returns the number of live subscribers
    pub fn post(&self, block: Block) -> usize {
        self.tx.send(NewMinedBlockEvent { block }).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewMinedBlockEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventMux {
    fn default() -> Self {
        Self::new()
    }
}
