//! Traits for the external collaborators: the daemon RPC client, the
//! persistent KV stores, and the notification sink. Modeled on
//! `floresta-chain`'s `ChainStore` trait — an associated `Error` type plus a
//! small set of get/put/prefix methods the core depends on without owning an
//! implementation.

use async_trait::async_trait;

use crate::cache::TouchedSets;
use crate::state::UtxoKey;
use crate::state::UtxoValue;

/// The daemon's RPC surface as consumed by the main loop and prefetcher.
/// The daemon is trusted: this core performs no block validation.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn height(&self) -> Result<u32, Self::Error>;
    async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, Self::Error>;

    /// Stream a block's raw bytes into `dest_path`, returning the byte count
    /// written. Implementations write to a temporary name and rename on
    /// success.
    async fn get_block(&self, hex_hash: &str, dest_path: &std::path::Path) -> Result<u64, Self::Error>;
}

/// `utxo_db`: UTXO entries plus UTXO-undo logs keyed by height.
pub trait UtxoStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_utxo(&self, key: &UtxoKey) -> Result<Option<UtxoValue>, Self::Error>;
    fn put_utxo(&self, key: &UtxoKey, value: &UtxoValue) -> Result<(), Self::Error>;
    fn delete_utxo(&self, key: &UtxoKey) -> Result<(), Self::Error>;

    fn get_utxo_undo(&self, height: u32) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put_utxo_undo(&self, height: u32, payload: &[u8]) -> Result<(), Self::Error>;
    fn delete_utxo_undo(&self, height: u32) -> Result<(), Self::Error>;
}

/// `asset_db`: all fourteen current/history asset-family tables plus their
/// undo prefixes. Kept as one trait since every family shares the same
/// get/put/delete/undo shape; callers key by the family's own byte prefix.
pub trait AssetStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get(&self, table_prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put(&self, table_prefix: &[u8], key: &[u8], value: &[u8]) -> Result<(), Self::Error>;
    fn delete(&self, table_prefix: &[u8], key: &[u8]) -> Result<(), Self::Error>;

    fn get_undo(&self, table_prefix: &[u8], height: u32) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put_undo(&self, table_prefix: &[u8], height: u32, payload: &[u8]) -> Result<(), Self::Error>;
    fn delete_undo(&self, table_prefix: &[u8], height: u32) -> Result<(), Self::Error>;
}

/// `suid_db`: the bidirectional name/hash ↔ id interning tables.
pub trait SuidStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn asset_to_id(&self, name: &[u8]) -> Result<Option<u32>, Self::Error>;
    fn id_to_asset(&self, id: u32) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put_asset_id(&self, name: &[u8], id: u32) -> Result<(), Self::Error>;
    fn delete_asset_id(&self, name: &[u8], id: u32) -> Result<(), Self::Error>;

    fn h160_to_id(&self, h160: &[u8; 20]) -> Result<Option<u32>, Self::Error>;
    fn id_to_h160(&self, id: u32) -> Result<Option<[u8; 20]>, Self::Error>;
    fn put_h160_id(&self, h160: &[u8; 20], id: u32) -> Result<(), Self::Error>;
    fn delete_h160_id(&self, h160: &[u8; 20], id: u32) -> Result<(), Self::Error>;
}

/// Bit flags naming which outpoint-bearing undo family a given id belongs to,
/// used only to keep `get`/`put`/`delete` call sites self-documenting.
pub mod asset_table {
    /// Undo log for newly-minted asset ids, keyed by height; the current
    /// name ↔ id mapping itself lives in the SUID store, not here.
    pub const ASSET_ID_UNDO: &[u8] = b"Iu";
    /// Undo log for newly-minted h160 ids, keyed by height.
    pub const H160_ID_UNDO: &[u8] = b"Hu";
    pub const METADATA: &[u8] = b"M";
    pub const METADATA_HISTORY: &[u8] = b"Mh";
    pub const BROADCAST: &[u8] = b"B";
    pub const ASSET_TAG_CURRENT: &[u8] = b"Tc";
    pub const ASSET_TAG_HISTORY: &[u8] = b"Th";
    pub const FREEZE_CURRENT: &[u8] = b"Fc";
    pub const FREEZE_HISTORY: &[u8] = b"Fh";
    pub const VERIFIER_CURRENT: &[u8] = b"Vc";
    pub const VERIFIER_HISTORY: &[u8] = b"Vh";
    pub const ASSOCIATION_CURRENT: &[u8] = b"Ac";
    pub const ASSOCIATION_HISTORY: &[u8] = b"Ah";
}

/// The single persisted `IndexerState` record, written on every flush and
/// read once at startup.
pub trait StateStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get_state(&self) -> Result<Option<crate::state::IndexerState>, Self::Error>;
    fn put_state(&self, state: &crate::state::IndexerState) -> Result<(), Self::Error>;
}

/// The file-system header store and history index: out-of-scope external
/// collaborators, consumed only through this trait. Headers are appended one
/// per height as the chain advances; `truncate_to` drops everything above a
/// height, used by the flush coordinator on a backup.
pub trait HeaderStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn append_header(&self, height: u32, header: &[u8]) -> Result<(), Self::Error>;
    /// The stored header at `height`, used by the reorg driver's divergence
    /// probe to compare local history against the daemon's.
    fn header_at(&self, height: u32) -> Result<Option<Vec<u8>>, Self::Error>;
    fn append_history(
        &self,
        tx_hashes: &[[u8; 32]],
        tx_hashxs: &[Vec<crate::state::HashX>],
    ) -> Result<(), Self::Error>;
    fn truncate_to(&self, height: u32) -> Result<(), Self::Error>;
}

/// Consumed once per commit while caught up: the touched sets, cleared by
/// the caller after the notification is emitted.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, touched: &TouchedSets);
}

/// A no-op notification sink, useful for tests and for `first_sync`.
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn notify(&self, _touched: &TouchedSets) {}
}
