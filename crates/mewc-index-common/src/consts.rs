//! Sentinel values and fixed widths shared by the wire codec, the cache and
//! the store adapters. Mirrors the constants named in the external interface
//! section of the indexer this crate implements.

/// Sentinel asset id meaning "the native coin, not an asset".
pub const NULL_U32: u32 = 0xFFFF_FFFF;

/// Sentinel 5-byte transaction sequence number, stored as a `u64` but only
/// ever serialized in its low 5 bytes.
pub const NULL_TXNUMB: u64 = 0xFF_FFFF_FFFF;

/// All-zero 32-byte hash, used as the coinbase `prev_hash`.
pub const ZERO: [u8; 32] = [0u8; 32];

/// Sentinel previous-output-index for a coinbase input.
pub const MINUS_1: u32 = 0xFFFF_FFFF;

/// Width in bytes of a hashX address fingerprint.
pub const HASHX_LEN: usize = 11;

/// Width in bytes of a tx num once serialized.
pub const TXNUM_LEN: usize = 5;

/// Width in bytes of an outpoint (4-byte vout ∥ 5-byte tx num).
pub const OUTPOINT_LEN: usize = 4 + TXNUM_LEN;

/// Serialized width of a UTXO cache value: hashX ∥ tx num ∥ value ∥ asset id.
pub const UTXO_VALUE_LEN: usize = HASHX_LEN + TXNUM_LEN + 8 + 4;

/// Fixed ownership-asset supply, in base units.
pub const OWNERSHIP_ASSET_SUPPLY: u64 = 100_000_000;

/// Canonical post-activation stored header length (basic header only, the
/// auxpow blob is never persisted).
pub const POST_AUXPOW_HEADER_LEN: usize = 120;

/// Basic block header length shared by every coin variant.
pub const BASIC_HEADER_LEN: usize = 80;

/// The asset-script magic, found immediately after `OP_MEWC_ASSET`.
pub const ASSET_MAGIC: [u8; 3] = *b"rvn";

/// Divisions byte meaning "inherit from the asset being reissued".
pub const DIVISIONS_UNCHANGED: u8 = 0xFF;

/// Default height lookback before which prefetched block files are swept.
pub const DEFAULT_STALE_FILE_LOOKBACK: u32 = 5;

/// Idle sleep between catch-up probes.
pub const DEFAULT_POLLING_DELAY_SECS: u64 = 3;

/// Cache monitor polling interval.
pub const CACHE_MONITOR_INTERVAL_SECS: u64 = 5;

/// Fraction of `next_block_hashes`'s prefetch window handed to the processor
/// in one pass (`hex_hashes[:(count+1)//2]`).
pub const PROCESS_WINDOW_NUMERATOR: u32 = 1;
pub const PROCESS_WINDOW_DENOMINATOR: u32 = 2;

/// Per-entry memory estimates used by the flush coordinator's size monitor,
/// in bytes. Mirrors the empirical constants used to estimate cache size.
pub mod cache_entry_bytes {
    pub const UTXO_PUT: usize = 213;
    pub const UTXO_DELETE: usize = 65;
    pub const ASSET_ID_INTERN: usize = 182;
    pub const H160_ID_INTERN: usize = 167;
    pub const ASSET_METADATA: usize = 237;
    pub const ASSET_METADATA_HISTORY: usize = 208;
    pub const BROADCAST: usize = 207;
    pub const TAG: usize = 158;
    pub const TAG_HISTORY: usize = 159;
    pub const FREEZE: usize = 153;
    pub const FREEZE_HISTORY: usize = 110;
    pub const VERIFIER: usize = 158;
    pub const VERIFIER_HISTORY: usize = 257;
    pub const ASSOCIATION: usize = 163;
    pub const ASSOCIATION_HISTORY: usize = 120;

    /// Per-tx and per-block estimate for the unflushed history index
    /// (`hist_MB`: "roughly ntxs * 32 + nblocks * 42").
    pub const HISTORY_PER_TX: usize = 32;
    pub const HISTORY_PER_BLOCK: usize = 42;
}
