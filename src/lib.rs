//! Ledger-Sync: the synchronization and propagation layer of a ledger node
//!
//! This crate sits between the peer-to-peer transport and the local chain
//! and transaction pool, featuring:
//! - Peer admission with status handshake, fork identity and peer caps
//! - Full, fast and snap sync mode selection with automatic fallback
//! - Square-root fan-out block and transaction propagation
//! - Trusted checkpoint challenges and whitelisted block pins
//! - Consensus packet relay with time-bounded de-duplication
//! - Abortable, ordered batch header verification
//!
//! # Example
//!
//! ```rust,no_run
//! use ledger_sync::config::HandlerSettings;
//! use ledger_sync::handler::{Handler, HandlerConfig};
//! use ledger_sync::memory::{
//!     IdleDownloader, InlineBlockFetcher, InlineTxFetcher, MemoryChain, MemoryTxPool,
//!     RecordingConsensus,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let handler = Arc::new(Handler::new(HandlerConfig {
//!     settings: HandlerSettings::default(),
//!     chain: Arc::new(MemoryChain::new(1)),
//!     tx_pool: Arc::new(MemoryTxPool::new()),
//!     downloader: Arc::new(IdleDownloader::new()),
//!     block_fetcher: Arc::new(InlineBlockFetcher::new()),
//!     tx_fetcher: Arc::new(InlineTxFetcher::new()),
//!     consensus: Arc::new(RecordingConsensus::new()),
//!     event_mux: None,
//! })?);
//!
//! handler.start(25);
//! println!("Node: {:?}", handler.node_info());
//! handler.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod handler;
pub mod memory;
pub mod network;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, HandlerSettings, TrustedCheckpoint};
pub use consensus::{ConsensusEngine, ConsensusHandler, ConsensusPacket, RebroadcastFilter};
pub use core::{Block, Chain, EventMux, ForkFilter, ForkId, Header, Transaction, TxPool};
pub use crypto::Hash;
pub use handler::{Handler, HandlerConfig, HandlerError, NodeInfo, SnapHandler};
pub use network::{Broadcaster, Message, Peer, PeerId, PeerSet};
pub use sync::{ChainDownloader, ChainSync, SyncMode, SyncState};
