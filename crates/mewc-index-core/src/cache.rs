//! Write-back cache: fourteen mutation families, each with pending
//! puts, pending deletes, and pending undo records, plus the seven touched
//! sets consumed by the notification sink.

use mewc_index_common::consts::cache_entry_bytes as bytes_per;

use crate::state::AssetMetadata;
use crate::state::AssociationKey;
use crate::state::HistoryFlag;
use crate::state::Outpoint;
use crate::state::UtxoKey;
use crate::state::UtxoValue;
use crate::state::VerifierRecord;

use std::collections::HashMap;
use std::collections::HashSet;

/// One mutation family: a pending-puts map, a pending-deletes list, and a
/// pending-undo-records list tagged with the height that produced them.
#[derive(Debug, Clone)]
pub struct MutationBuffer<K, V> {
    pub puts: HashMap<K, V>,
    pub deletes: Vec<K>,
    pub undo: Vec<(Vec<u8>, u32)>,
}

impl<K: std::hash::Hash + Eq + Clone, V> Default for MutationBuffer<K, V> {
    fn default() -> Self {
        MutationBuffer {
            puts: HashMap::new(),
            deletes: Vec::new(),
            undo: Vec::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone, V> MutationBuffer<K, V> {
    pub fn put(&mut self, key: K, value: V) {
        self.puts.insert(key, value);
    }

    pub fn delete(&mut self, key: K) {
        self.deletes.push(key);
    }

    pub fn record_undo(&mut self, payload: Vec<u8>, height: u32) {
        self.undo.push((payload, height));
    }

    /// Same as `record_undo`, but a no-op when `enabled` is false: blocks
    /// deep enough that a reorg can no longer reach them don't need undo
    /// data kept around.
    pub fn record_undo_if(&mut self, enabled: bool, payload: Vec<u8>, height: u32) {
        if enabled {
            self.undo.push((payload, height));
        }
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty() && self.undo.is_empty()
    }

    pub fn clear(&mut self) {
        self.puts.clear();
        self.deletes.clear();
        self.undo.clear();
    }
}

/// Seven sets of identifiers touched since the last notification emit
/// Cleared by the caller right after `notify`.
#[derive(Debug, Default, Clone)]
pub struct TouchedSets {
    pub hash_x: HashSet<[u8; 11]>,
    pub asset_name: HashSet<Vec<u8>>,
    pub qualifier: HashSet<Vec<u8>>,
    pub h160: HashSet<[u8; 20]>,
    pub broadcast_asset: HashSet<Vec<u8>>,
    pub frozen_asset: HashSet<Vec<u8>>,
    pub validator_asset: HashSet<Vec<u8>>,
    pub qualifier_association: HashSet<Vec<u8>>,
}

impl TouchedSets {
    pub fn clear(&mut self) {
        self.hash_x.clear();
        self.asset_name.clear();
        self.qualifier.clear();
        self.h160.clear();
        self.broadcast_asset.clear();
        self.frozen_asset.clear();
        self.validator_asset.clear();
        self.qualifier_association.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.hash_x.is_empty()
            && self.asset_name.is_empty()
            && self.qualifier.is_empty()
            && self.h160.is_empty()
            && self.broadcast_asset.is_empty()
            && self.frozen_asset.is_empty()
            && self.validator_asset.is_empty()
            && self.qualifier_association.is_empty()
    }
}

/// The fourteen mutation families, plus the pending tx-hash
/// buffer and per-tx hashX history index the advance engine appends to.
#[derive(Default)]
pub struct WriteBackCache {
    pub utxo: MutationBuffer<UtxoKey, UtxoValue>,
    pub asset_id_intern: MutationBuffer<Vec<u8>, u32>,
    pub h160_id_intern: MutationBuffer<[u8; 20], u32>,
    pub asset_metadata: MutationBuffer<u32, AssetMetadata>,
    pub asset_metadata_history: MutationBuffer<(u32, Outpoint), AssetMetadata>,
    pub broadcasts: MutationBuffer<(u32, Outpoint), Vec<u8>>,
    pub tags: MutationBuffer<(u32, u32), Outpoint>,
    pub tag_history: MutationBuffer<(u32, u32, Outpoint), HistoryFlag>,
    pub freezes: MutationBuffer<u32, Outpoint>,
    pub freeze_history: MutationBuffer<(u32, Outpoint), HistoryFlag>,
    pub verifiers: MutationBuffer<u32, VerifierRecord>,
    pub verifier_history: MutationBuffer<(u32, Outpoint), Vec<u8>>,
    pub associations: MutationBuffer<AssociationKey, Outpoint>,
    pub association_history: MutationBuffer<(AssociationKey, Outpoint), HistoryFlag>,

    /// Per-block tx hashes pending a header-file/history-index flush.
    pub pending_tx_hashes: Vec<[u8; 32]>,
    /// Per-transaction hashX lists, for the history index.
    pub pending_tx_hashxs: Vec<Vec<[u8; 11]>>,
    /// Headers for blocks advanced since the last flush, already padded to
    /// their height's canonical stored length.
    pub pending_headers: Vec<(u32, Vec<u8>)>,
    /// Number of blocks appended since the last flush, for `hist_mb`'s
    /// per-block estimate.
    pub pending_block_count: usize,

    pub touched: TouchedSets,

    /// Set by the advance engine while a batch is mid-flight; the flush
    /// coordinator must defer while this is true.
    pub processing_blocks: bool,
}

impl WriteBackCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// All fourteen families plus the pending headers/tx buffers are empty.
    /// Precondition for `backup_block` (`assert_flushed`).
    pub fn is_flushed(&self) -> bool {
        self.utxo.is_empty()
            && self.asset_id_intern.is_empty()
            && self.h160_id_intern.is_empty()
            && self.asset_metadata.is_empty()
            && self.asset_metadata_history.is_empty()
            && self.broadcasts.is_empty()
            && self.tags.is_empty()
            && self.tag_history.is_empty()
            && self.freezes.is_empty()
            && self.freeze_history.is_empty()
            && self.verifiers.is_empty()
            && self.verifier_history.is_empty()
            && self.associations.is_empty()
            && self.association_history.is_empty()
            && self.pending_tx_hashes.is_empty()
            && self.pending_headers.is_empty()
    }

    /// Unconditionally clear every buffer, used by the reorg driver before
    /// the first backup: an interrupted flush may leave residue
    /// incompatible with `assert_flushed`.
    pub fn clear_all(&mut self) {
        self.utxo.clear();
        self.asset_id_intern.clear();
        self.h160_id_intern.clear();
        self.asset_metadata.clear();
        self.asset_metadata_history.clear();
        self.broadcasts.clear();
        self.tags.clear();
        self.tag_history.clear();
        self.freezes.clear();
        self.freeze_history.clear();
        self.verifiers.clear();
        self.verifier_history.clear();
        self.associations.clear();
        self.association_history.clear();
        self.pending_tx_hashes.clear();
        self.pending_tx_hashxs.clear();
        self.pending_headers.clear();
        self.pending_block_count = 0;
        self.touched.clear();
    }

    /// Rough combined cache size estimate in megabytes, using the empirical
    /// per-entry size constants.
    pub fn utxo_mb(&self) -> f64 {
        let bytes = self.utxo.puts.len() * bytes_per::UTXO_PUT
            + self.utxo.deletes.len() * bytes_per::UTXO_DELETE;
        bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn asset_mb(&self) -> f64 {
        let bytes = self.asset_id_intern.len() * bytes_per::ASSET_ID_INTERN
            + self.h160_id_intern.len() * bytes_per::H160_ID_INTERN
            + self.asset_metadata.len() * bytes_per::ASSET_METADATA
            + self.asset_metadata_history.len() * bytes_per::ASSET_METADATA_HISTORY
            + self.broadcasts.len() * bytes_per::BROADCAST
            + self.tags.len() * bytes_per::TAG
            + self.tag_history.len() * bytes_per::TAG_HISTORY
            + self.freezes.len() * bytes_per::FREEZE
            + self.freeze_history.len() * bytes_per::FREEZE_HISTORY
            + self.verifiers.len() * bytes_per::VERIFIER
            + self.verifier_history.len() * bytes_per::VERIFIER_HISTORY
            + self.associations.len() * bytes_per::ASSOCIATION
            + self.association_history.len() * bytes_per::ASSOCIATION_HISTORY;
        bytes as f64 / (1024.0 * 1024.0)
    }

    pub fn hist_mb(&self) -> f64 {
        let ntx = self.pending_tx_hashes.len();
        let bytes = ntx * bytes_per::HISTORY_PER_TX
            + self.pending_block_count * bytes_per::HISTORY_PER_BLOCK;
        bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_cache_is_flushed() {
        let cache = WriteBackCache::new();
        assert!(cache.is_flushed());
        assert_eq!(cache.utxo_mb(), 0.0);
    }

    #[test]
    fn clear_all_resets_touched_and_buffers() {
        let mut cache = WriteBackCache::new();
        cache.utxo.put(
            UtxoKey {
                tx_hash: [1u8; 32],
                vout: 0,
            },
            UtxoValue {
                hash_x: [0u8; 11],
                tx_num: 0,
                value: 1,
                asset_id: 0,
            },
        );
        cache.touched.h160.insert([2u8; 20]);
        assert!(!cache.is_flushed());
        cache.clear_all();
        assert!(cache.is_flushed());
        assert!(cache.touched.is_empty());
    }
}
