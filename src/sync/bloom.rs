//! Fast-sync state bloom
//!
//! Tracks which state entries have already been committed during a fast
//! sync so the downloader can skip fetching them again. A false positive
//! only costs a redundant database lookup.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

/// Number of hash functions
pub const STATE_BLOOM_HASHES: u32 = 4;

/// Smallest filter allocated, regardless of budget
const MIN_BLOOM_BYTES: usize = 1024;

/// Bloom filter over state entry keys
#[derive(Debug)]
pub struct StateBloom {
    data: RwLock<Vec<u8>>,
    tweak: u32,
}

impl StateBloom {
    /// Create a filter using up to `cache_mb` megabytes
    pub fn with_budget(cache_mb: u64) -> Self {
        let bytes = usize::try_from(cache_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX);
        let bytes = bytes.max(MIN_BLOOM_BYTES);
        log::info!("Allocated fast sync bloom: {} MB", bytes / (1024 * 1024));
        Self {
            data: RwLock::new(vec![0u8; bytes]),
            tweak: rand::random(),
        }
    }

    /// Size of the filter in bytes
    pub fn size(&self) -> usize {
        self.data.read().len()
    }

    pub fn insert(&self, key: &[u8]) {
        let mut data = self.data.write();
        let bits = data.len() * 8;
        for i in 0..STATE_BLOOM_HASHES {
            let idx = self.hash(key, i, bits);
            data[idx / 8] |= 1 << (idx % 8);
        }
    }

    /// Whether the key might have been inserted
    pub fn contains(&self, key: &[u8]) -> bool {
        let data = self.data.read();
        let bits = data.len() * 8;
        (0..STATE_BLOOM_HASHES).all(|i| {
            let idx = self.hash(key, i, bits);
            data[idx / 8] & (1 << (idx % 8)) != 0
        })
    }

    fn hash(&self, key: &[u8], n: u32, bits: usize) -> usize {
        let seed = n.wrapping_mul(0xFBA4C795).wrapping_add(self.tweak);
        let mut hasher = Sha256::new();
        hasher.update(seed.to_le_bytes());
        hasher.update(key);
        let hash = hasher.finalize();

        let idx = u64::from_le_bytes([
            hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
        ]);
        (idx % bits as u64) as usize
    }
}
