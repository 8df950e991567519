//! The persisted data model: indexer state, UTXO entries, the
//! small-unique-id interning tables, and the asset-family records.

use mewc_index_common::NULL_TXNUMB;
use mewc_index_common::NULL_U32;

/// Single persisted instance, written with every flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerState {
    pub height: u32,
    pub tip: [u8; 32],
    pub chain_size: u64,
    pub utxo_count: u64,
    pub tx_count: u64,
    pub asset_count: u32,
    pub h160_count: u32,
    pub first_sync: bool,
}

impl Default for IndexerState {
    fn default() -> Self {
        IndexerState {
            height: 0,
            tip: [0u8; 32],
            chain_size: 0,
            utxo_count: 0,
            tx_count: 0,
            asset_count: 0,
            h160_count: 0,
            first_sync: true,
        }
    }
}

/// Stable reference to an output: 4-byte vout ∥ 5-byte tx num.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Outpoint {
    pub vout: u32,
    pub tx_num: u64,
}

impl Outpoint {
    pub const LEN: usize = 4 + 5;

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[0..4].copy_from_slice(&self.vout.to_le_bytes());
        out[4..9].copy_from_slice(&self.tx_num.to_le_bytes()[0..5]);
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::LEN]) -> Self {
        let vout = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut tx_num_bytes = [0u8; 8];
        tx_num_bytes[0..5].copy_from_slice(&bytes[4..9]);
        Outpoint {
            vout,
            tx_num: u64::from_le_bytes(tx_num_bytes),
        }
    }
}

/// An 11-byte address fingerprint.
pub type HashX = [u8; 11];

/// UTXO cache/store key: tx hash ∥ little-endian output index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UtxoKey {
    pub tx_hash: [u8; 32],
    pub vout: u32,
}

/// UTXO cache/store value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtxoValue {
    pub hash_x: HashX,
    pub tx_num: u64,
    pub value: u64,
    pub asset_id: u32,
}

impl UtxoValue {
    pub fn is_native_coin(&self) -> bool {
        self.asset_id == NULL_U32
    }
}

/// One asset's current metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMetadata {
    pub total_supply: u64,
    pub divisions: u8,
    pub reissuable: bool,
    pub associated_data: Option<[u8; 34]>,
    pub defining_outpoint: Outpoint,
    /// Outpoint of the reissuance that last set `divisions`, when it wasn't
    /// this record's own defining outpoint.
    pub divisions_source: Option<Outpoint>,
    /// Outpoint of the reissuance that last set `associated_data`.
    pub associated_data_source: Option<Outpoint>,
}

/// Append-only per-(asset, outpoint) snapshot of one reissuance's delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetMetadataHistoryEntry {
    pub asset_id: u32,
    pub outpoint: Outpoint,
    pub prior: AssetMetadata,
}

/// A message-broadcast payload for a transfer carrying `!`/`~` semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub asset_id: u32,
    pub outpoint: Outpoint,
    pub data_hash: [u8; 34],
    pub timestamp: Option<u64>,
}

/// A single history-table flag: set (tag/freeze applied) or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFlag {
    Set,
    Cleared,
}

impl HistoryFlag {
    pub fn to_byte(self) -> u8 {
        match self {
            HistoryFlag::Set => 1,
            HistoryFlag::Cleared => 0,
        }
    }

    pub fn from_byte(b: u8) -> Self {
        if b != 0 {
            HistoryFlag::Set
        } else {
            HistoryFlag::Cleared
        }
    }
}

/// Current verifier-string record for a restricted asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierRecord {
    pub restricted_id: u32,
    pub restricted_outpoint: Outpoint,
    pub verifier_outpoint: Outpoint,
    pub tx_num: u64,
}

/// Association between a qualifier id and a restricted-asset id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    pub qualifier_id: u32,
    pub restricted_id: u32,
}

/// A tx-num sentinel meaning "never assigned".
pub fn null_tx_num() -> u64 {
    NULL_TXNUMB
}
