//! Block-processing core for an asset-chain indexer: wire codec, the
//! advance/backup engines, the write-back cache, the reorg driver, and the
//! block prefetcher. Pure logic plus trait-bounded store adapters; no
//! concrete storage backend or daemon client lives in this crate.

pub mod advance;
pub mod asset;
pub mod backup;
pub mod block;
pub mod cache;
pub mod codec;
pub mod flush;
pub mod orchestrator;
pub mod prefetch;
pub mod reorg;
pub mod state;
pub mod store;
pub mod tx;

pub use advance::AdvanceEngine;
pub use advance::AdvanceOutcome;
pub use backup::BackupEngine;
pub use block::CoinParams;
pub use block::OnDiskBlock;
pub use cache::WriteBackCache;
pub use flush::FlushCoordinator;
pub use orchestrator::Orchestrator;
pub use prefetch::Prefetcher;
pub use reorg::ReorgDriver;
pub use state::IndexerState;
