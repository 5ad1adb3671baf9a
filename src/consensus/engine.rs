//! Consensus engine contract
//!
//! Header verification comes in two forms: a single synchronous check
//! used by the block fetcher, and an abortable batch that verifies on a
//! blocking worker while results stream back in input order.

use crate::core::block::{Block, Header};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Consensus validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("Unknown block")]
    UnknownBlock,
    #[error("Unknown ancestor")]
    UnknownAncestor,
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Rejected by consensus handler: {0}")]
    Rejected(String),
}

/// Pluggable consensus engine
pub trait ConsensusEngine: Send + Sync + 'static {
    /// Verify a single header
    fn verify_header(&self, header: &Header) -> Result<(), ConsensusError>;

    /// Verify a batch of headers concurrently with result delivery
    fn verify_headers(self: Arc<Self>, headers: Vec<Header>) -> HeaderVerification {
        HeaderVerification::spawn(headers, move |header| self.verify_header(header))
    }

    /// Difficulty of a block built on top of `parent`
    fn calc_difficulty(&self, parent: &Header) -> u128;

    /// Seal a locally produced block
    fn seal(&self, block: Block) -> Result<Block, ConsensusError>;
}

/// An in-flight batch header verification
///
/// Results arrive 1:1 and in order with the input headers. Once aborted
/// the worker stops producing and `next` yields nothing further.
pub struct HeaderVerification {
    abort: CancellationToken,
    results: mpsc::Receiver<Result<(), ConsensusError>>,
}

impl HeaderVerification {
    /// Run `verify` over `headers` on a blocking worker
    pub fn spawn<F>(headers: Vec<Header>, verify: F) -> Self
    where
        F: Fn(&Header) -> Result<(), ConsensusError> + Send + 'static,
    {
        // Sized to the input so the worker never waits on the consumer
        let (tx, results) = mpsc::channel(headers.len().max(1));
        let abort = CancellationToken::new();
        let token = abort.clone();

        tokio::task::spawn_blocking(move || {
            for header in &headers {
                if token.is_cancelled() {
                    return;
                }
                let result = match header.number {
                    None => Err(ConsensusError::UnknownBlock),
                    Some(_) => verify(header),
                };
                if token.is_cancelled() || tx.try_send(result).is_err() {
                    return;
                }
            }
        });

        Self { abort, results }
    }

    /// Signal the worker to stop; safe to call any number of times
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Handle that aborts this verification from elsewhere
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Next result in input order, `None` once finished or aborted
    pub async fn next(&mut self) -> Option<Result<(), ConsensusError>> {
        if self.abort.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            result = self.results.recv() => result,
        }
    }
}

/// Engine that accepts every well-formed header
#[derive(Debug, Clone)]
pub struct NoopEngine {
    difficulty: u128,
}

impl NoopEngine {
    pub fn new(difficulty: u128) -> Self {
        Self { difficulty }
    }
}

impl Default for NoopEngine {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ConsensusEngine for NoopEngine {
    fn verify_header(&self, header: &Header) -> Result<(), ConsensusError> {
        match header.number {
            Some(_) => Ok(()),
            None => Err(ConsensusError::UnknownBlock),
        }
    }

    fn calc_difficulty(&self, _parent: &Header) -> u128 {
        self.difficulty
    }

    fn seal(&self, block: Block) -> Result<Block, ConsensusError> {
        Ok(block)
    }
}
