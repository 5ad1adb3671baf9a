//! Fork identity
//!
//! A compact fingerprint of the chain's upgrade history, exchanged during
//! the handshake so incompatible peers are rejected before any sync work.

use crate::crypto::Hash;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Fork identity validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForkIdError {
    #[error("Remote peer is stale: announced next fork {announced}, expected {expected}")]
    RemoteStale { announced: u64, expected: u64 },
    #[error("Local chain is incompatible or stale")]
    LocalIncompatibleOrStale,
}

/// Fork identifier: checksum of passed forks and the next scheduled one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkId {
    pub hash: [u8; 4],
    /// Next fork block, zero if none is scheduled
    pub next: u64,
}

impl ForkId {
    /// Compute the identifier for a chain at the given head height
    pub fn new(genesis: Hash, forks: &[u64], head: u64) -> Self {
        let forks = normalize(forks);
        let sums = checksums(genesis, &forks);
        let stage = forks.iter().take_while(|f| **f <= head).count();
        Self {
            hash: sums[stage],
            next: forks.get(stage).copied().unwrap_or(0),
        }
    }
}

fn normalize(forks: &[u64]) -> Vec<u64> {
    let mut forks: Vec<u64> = forks.iter().copied().filter(|f| *f > 0).collect();
    forks.sort_unstable();
    forks.dedup();
    forks
}

fn truncate(hash: Hash) -> [u8; 4] {
    let bytes = hash.as_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Checksums after 0, 1, ..., n forks
fn checksums(genesis: Hash, forks: &[u64]) -> Vec<[u8; 4]> {
    let mut sums = Vec::with_capacity(forks.len() + 1);
    let mut sum = truncate(Hash::digest(&[genesis.as_bytes()]));
    sums.push(sum);
    for fork in forks {
        sum = truncate(Hash::digest(&[&sum, &fork.to_be_bytes()]));
        sums.push(sum);
    }
    sums
}

/// Validates remote fork identifiers against the local chain
#[derive(Clone)]
pub struct ForkFilter {
    forks: Vec<u64>,
    sums: Vec<[u8; 4]>,
    head: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl ForkFilter {
    pub fn new(genesis: Hash, forks: &[u64], head: Arc<dyn Fn() -> u64 + Send + Sync>) -> Self {
        let forks = normalize(forks);
        let sums = checksums(genesis, &forks);
        Self { forks, sums, head }
    }

    /// Local identifier at the current head
    pub fn local(&self) -> ForkId {
        let stage = self.stage((self.head)());
        ForkId {
            hash: self.sums[stage],
            next: self.forks.get(stage).copied().unwrap_or(0),
        }
    }

    fn stage(&self, head: u64) -> usize {
        self.forks.iter().take_while(|f| **f <= head).count()
    }

    pub fn validate(&self, remote: &ForkId) -> Result<(), ForkIdError> {
        let head = (self.head)();
        let stage = self.stage(head);

        // Same set of passed forks
        if remote.hash == self.sums[stage] {
            if remote.next > 0 && head >= remote.next {
                return Err(ForkIdError::LocalIncompatibleOrStale);
            }
            return Ok(());
        }

        // Remote is behind us: it must know about the fork we passed next
        if let Some(j) = self.sums[..stage].iter().position(|s| *s == remote.hash) {
            let expected = self.forks[j];
            if remote.next == expected {
                return Ok(());
            }
            return Err(ForkIdError::RemoteStale {
                announced: remote.next,
                expected,
            });
        }

        // Remote is ahead on a fork we know about but have not reached yet
        if self.sums[stage + 1..].contains(&remote.hash) {
            return Ok(());
        }

        Err(ForkIdError::LocalIncompatibleOrStale)
    }
}

impl std::fmt::Debug for ForkFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkFilter")
            .field("forks", &self.forks)
            .finish()
    }
}
