//! Handler settings
//!
//! Construction-time parameters of the protocol handler, loadable from a
//! JSON file. Runtime handles (chain, pool, collaborators) are attached
//! separately in `HandlerConfig`.

use crate::crypto::Hash;
use crate::sync::SyncMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Blocks per checkpoint section
pub const CHECKPOINT_FREQUENCY: u64 = 32768;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Operator-trusted checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedCheckpoint {
    pub section_index: u64,
    pub section_head: Hash,
}

impl TrustedCheckpoint {
    /// Height of the last block in the checkpointed section
    pub fn number(&self) -> u64 {
        (self.section_index + 1) * CHECKPOINT_FREQUENCY - 1
    }

    pub fn hash(&self) -> Hash {
        self.section_head
    }
}

/// Protocol handler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerSettings {
    pub network_id: u64,
    pub sync_mode: SyncMode,
    /// Memory budget for the fast-sync state bloom, in megabytes
    pub bloom_cache_mb: u64,
    pub checkpoint: Option<TrustedCheckpoint>,
    /// Pinned block hashes peers must agree with
    pub whitelist: BTreeMap<u64, Hash>,
    /// Peers a received consensus packet is relayed to; 0 means all
    pub rebroadcast_fanout: usize,
    pub rebroadcast_retention_secs: u64,
    pub checkpoint_challenge_timeout_secs: u64,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            network_id: 1,
            sync_mode: SyncMode::Full,
            bloom_cache_mb: 64,
            checkpoint: None,
            whitelist: BTreeMap::new(),
            rebroadcast_fanout: 0,
            rebroadcast_retention_secs: 60,
            checkpoint_challenge_timeout_secs: 15,
        }
    }
}

impl HandlerSettings {
    /// Load and validate settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = fs::File::open(path)?;
        let settings: Self = serde_json::from_reader(BufReader::new(file))?;
        settings.validate()?;
        log::debug!("Loaded handler settings from {}", path.display());
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_id == 0 {
            return Err(ConfigError::Invalid("network_id must be non-zero".into()));
        }
        if self.rebroadcast_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "rebroadcast_retention_secs must be non-zero".into(),
            ));
        }
        if self.checkpoint_challenge_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_challenge_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn rebroadcast_retention(&self) -> Duration {
        Duration::from_secs(self.rebroadcast_retention_secs)
    }

    pub fn checkpoint_challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.checkpoint_challenge_timeout_secs)
    }
}
