//! Cryptographic utilities
//!
//! SHA-256 hashing and the `Hash` identifier shared by every module.

pub mod hash;

pub use hash::{sha256, sha256_hex, Hash, HashParseError, HASH_LENGTH};
