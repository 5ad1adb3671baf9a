//! Rebroadcast de-duplication for consensus packets
//!
//! Remembers when each packet hash was first seen. A packet seen again
//! inside the retention window is suppressed. Expired entries are purged
//! by an opportunistic sweep that runs at most once per window.

use crate::crypto::Hash;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Default retention window for seen packets
pub const DEFAULT_REBROADCAST_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct SeenPackets {
    /// Packet hash -> unix nanos of first observation
    first_seen: HashMap<Hash, i64>,
    last_cleanup: i64,
}

/// Time-bounded set of recently relayed packet hashes
#[derive(Debug)]
pub struct RebroadcastFilter {
    retention_nanos: i64,
    seen: Mutex<SeenPackets>,
}

impl RebroadcastFilter {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention_nanos: i64::try_from(retention.as_nanos()).unwrap_or(i64::MAX),
            seen: Mutex::new(SeenPackets::default()),
        }
    }

    /// Record the packet; returns true if it should be relayed
    pub fn observe(&self, hash: Hash) -> bool {
        self.observe_at(hash, now_nanos())
    }

    /// Like `observe`, with an explicit clock reading in unix nanos
    pub fn observe_at(&self, hash: Hash, now: i64) -> bool {
        let mut seen = self.seen.lock();

        if now.saturating_sub(seen.last_cleanup) >= self.retention_nanos {
            let cutoff = now.saturating_sub(self.retention_nanos);
            let before = seen.first_seen.len();
            seen.first_seen.retain(|_, first| *first > cutoff);
            seen.last_cleanup = now;
            let purged = before - seen.first_seen.len();
            if purged > 0 {
                log::trace!("Purged {} expired rebroadcast entries", purged);
            }
        }

        match seen.first_seen.get(&hash) {
            Some(first) if now.saturating_sub(*first) < self.retention_nanos => false,
            _ => {
                seen.first_seen.insert(hash, now);
                true
            }
        }
    }

    /// Number of tracked packet hashes
    pub fn len(&self) -> usize {
        self.seen.lock().first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RebroadcastFilter {
    fn default() -> Self {
        Self::new(DEFAULT_REBROADCAST_RETENTION)
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}
