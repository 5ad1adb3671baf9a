//! Chain synchronization
//!
//! - Sync mode selection and the shared atomic sync state
//! - Collaborator contracts for the downloader and the fetchers
//! - The fast-sync state bloom
//! - The sync orchestrator loop

pub mod bloom;
pub mod chainsync;
pub mod downloader;
pub mod fetcher;
pub mod mode;

pub use bloom::StateBloom;
pub use chainsync::{ChainSync, SyncOp, FORCE_SYNC_CYCLE, MIN_DESIRED_PEERS};
pub use downloader::{ChainDownloader, DownloaderError, DownloaderHooks, DropPeerFn, HeightFn};
pub use fetcher::{
    BlockFetcher, BlockFetcherHooks, DeferReason, FetcherError, ImportOutcome, TxFetcher,
    TxFetcherHooks,
};
pub use mode::{ParseSyncModeError, SyncMode, SyncState};
