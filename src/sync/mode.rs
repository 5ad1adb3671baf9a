//! Sync strategies and their runtime state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use thiserror::Error;

/// Chain synchronization strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download and execute every block
    #[default]
    Full,
    /// Download headers and bodies ahead of state
    Fast,
    /// Retrieve flattened state snapshots
    Snap,
}

impl SyncMode {
    fn to_u8(self) -> u8 {
        match self {
            SyncMode::Full => 0,
            SyncMode::Fast => 1,
            SyncMode::Snap => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncMode::Fast,
            2 => SyncMode::Snap,
            _ => SyncMode::Full,
        }
    }

    /// Resolve the requested mode against what is persisted locally
    ///
    /// A full sync over an abandoned fast sync resumes the fast sync; a
    /// fast or snap sync over an already populated chain falls back to full.
    pub fn resolve(requested: SyncMode, full_height: u64, fast_height: u64) -> SyncMode {
        match requested {
            SyncMode::Full if full_height == 0 && fast_height > 0 => SyncMode::Fast,
            SyncMode::Fast | SyncMode::Snap if full_height > 0 => SyncMode::Full,
            mode => mode,
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncMode::Full => "full",
            SyncMode::Fast => "fast",
            SyncMode::Snap => "snap",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("Unknown sync mode: {0}")]
pub struct ParseSyncModeError(String);

impl FromStr for SyncMode {
    type Err = ParseSyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "fast" => Ok(SyncMode::Fast),
            "snap" => Ok(SyncMode::Snap),
            other => Err(ParseSyncModeError(other.to_string())),
        }
    }
}

/// Flags polled by every peer task and background loop
#[derive(Debug)]
pub struct SyncState {
    mode: AtomicU8,
    accept_txs: AtomicBool,
}

impl SyncState {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode: AtomicU8::new(mode.to_u8()),
            accept_txs: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> SyncMode {
        SyncMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: SyncMode) {
        self.mode.store(mode.to_u8(), Ordering::Release);
    }

    /// Whether a fast or snap sync is still in progress
    pub fn is_fast_syncing(&self) -> bool {
        self.mode() != SyncMode::Full
    }

    pub fn accepts_txs(&self) -> bool {
        self.accept_txs.load(Ordering::Acquire)
    }

    /// Start accepting transactions; never reverts while the process runs
    pub fn enable_tx_acceptance(&self) -> bool {
        !self.accept_txs.swap(true, Ordering::AcqRel)
    }
}
