//! Consensus-facing contracts
//!
//! - `ConsensusEngine`: header verification, difficulty and sealing
//! - `ConsensusHandler`: relay target for out-of-band consensus packets
//! - `RebroadcastFilter`: time-bounded packet de-duplication

pub mod engine;
pub mod rebroadcast;
pub mod relay;

pub use engine::{ConsensusEngine, ConsensusError, HeaderVerification, NoopEngine};
pub use rebroadcast::{RebroadcastFilter, DEFAULT_REBROADCAST_RETENTION};
pub use relay::{ConsensusHandler, ConsensusPacket};
