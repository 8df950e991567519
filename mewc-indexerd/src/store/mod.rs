//! Concrete `redb`-backed implementations of the core's store traits, one
//! database file per logical store (`utxo_db`, `asset_db`, `suid_db`), plus a
//! flat-file header store and a one-row state record. Modeled on
//! `floresta-chain`'s `KvChainStore`: a thin wrapper around `redb::Database`
//! with an `LruCache` for the hot path, guarded by `spin::Mutex` since the
//! cache is mutated from `&self` methods.

mod asset_store;
mod header_store;
mod state_store;
mod suid_store;
mod utxo_store;

pub use asset_store::RedbAssetStore;
pub use header_store::FileHeaderStore;
pub use state_store::RedbStateStore;
pub use suid_store::RedbSuidStore;
pub use utxo_store::RedbUtxoStore;
