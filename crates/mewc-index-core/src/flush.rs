//! Flush coordinator: a cooperative size/lag monitor plus the transactional
//! writer that drains the write-back cache's fourteen families, the state
//! record, the pending headers, and the history-index delta into the
//! backing stores.

use mewc_index_common::ChainError;

use crate::cache::WriteBackCache;
use crate::state::IndexerState;
use crate::store::asset_table;
use crate::store::AssetStore;
use crate::store::HeaderStore;
use crate::store::StateStore;
use crate::store::SuidStore;
use crate::store::UtxoStore;

/// Result of one size/lag poll: whether a flush should happen at all, and
/// whether UTXO entries specifically must be included (history alone can be
/// flushed more cheaply than the whole cache).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushDecision {
    pub should_flush: bool,
    pub include_utxo: bool,
}

/// Fraction of `cache_mb_budget` at which UTXO+asset memory alone forces a
/// flush to include UTXO entries, not just history.
const UTXO_FORCE_FRACTION: f64 = 0.8;

/// Every 5s poll's input: current cache estimates plus the two external
/// signals (caught-up-with-buffered-block, daemon lag) that can also force a
/// flush regardless of memory pressure.
pub fn decide(
    cache: &WriteBackCache,
    cache_mb_budget: f64,
    caught_up: bool,
    daemon_lag_blocks: u32,
) -> FlushDecision {
    if cache.processing_blocks {
        return FlushDecision {
            should_flush: false,
            include_utxo: false,
        };
    }

    let utxo_mb = cache.utxo_mb();
    let asset_mb = cache.asset_mb();
    let hist_mb = cache.hist_mb();
    let combined = utxo_mb + asset_mb + hist_mb;

    let over_budget = combined >= cache_mb_budget;
    let history_over_budget = hist_mb >= cache_mb_budget / 5.0;
    let caught_up_with_buffered_block = caught_up && cache.pending_block_count >= 1;
    let lagging = daemon_lag_blocks > 1;

    let should_flush = over_budget || history_over_budget || caught_up_with_buffered_block || lagging;
    let include_utxo = (utxo_mb + asset_mb) >= cache_mb_budget * UTXO_FORCE_FRACTION;

    FlushDecision {
        should_flush,
        include_utxo,
    }
}

pub struct FlushCoordinator<'a, U, A, S, H, T> {
    pub utxo_store: &'a U,
    pub asset_store: &'a A,
    pub suid_store: &'a S,
    pub header_store: &'a H,
    pub state_store: &'a T,
}

impl<'a, U, A, S, H, T> FlushCoordinator<'a, U, A, S, H, T>
where
    U: UtxoStore,
    A: AssetStore,
    S: SuidStore,
    H: HeaderStore,
    T: StateStore,
{
    /// Drains every pending buffer into the backing stores in one pass, then
    /// clears the cache. A no-op (and thus idempotent) when nothing is
    /// pending: `pending_tx_hashes` is empty exactly when no block has been
    /// advanced since the last flush.
    pub fn flush(&self, state: &IndexerState, cache: &mut WriteBackCache) -> Result<(), ChainError> {
        if cache.pending_tx_hashes.is_empty() {
            return Ok(());
        }

        self.flush_utxo(cache)?;
        self.flush_id_family(cache, true)?;
        self.flush_id_family(cache, false)?;
        self.flush_metadata(cache)?;
        self.flush_history_family(
            &mut cache.asset_metadata_history,
            asset_table::METADATA_HISTORY,
            |(asset_id, outpoint)| crate::advance::encode_history_key(*asset_id, *outpoint),
            |v| crate::advance::encode_metadata(v),
        )?;
        self.flush_history_family(
            &mut cache.broadcasts,
            asset_table::BROADCAST,
            |(asset_id, outpoint)| crate::advance::encode_history_key(*asset_id, *outpoint),
            |v: &Vec<u8>| v.clone(),
        )?;
        self.flush_current_family(
            &mut cache.tags,
            asset_table::ASSET_TAG_CURRENT,
            |(a, b)| crate::advance::encode_pair_key(*a, *b),
            |v| v.to_bytes().to_vec(),
        )?;
        self.flush_history_family(
            &mut cache.tag_history,
            asset_table::ASSET_TAG_HISTORY,
            |(a, b, outpoint)| crate::advance::encode_history_triple(*a, *b, *outpoint),
            |f| vec![f.to_byte()],
        )?;
        self.flush_current_family(
            &mut cache.freezes,
            asset_table::FREEZE_CURRENT,
            |asset_id| asset_id.to_le_bytes().to_vec(),
            |v| v.to_bytes().to_vec(),
        )?;
        self.flush_history_family(
            &mut cache.freeze_history,
            asset_table::FREEZE_HISTORY,
            |(asset_id, outpoint)| crate::advance::encode_history_key(*asset_id, *outpoint),
            |f| vec![f.to_byte()],
        )?;
        self.flush_current_family(
            &mut cache.verifiers,
            asset_table::VERIFIER_CURRENT,
            |id| id.to_le_bytes().to_vec(),
            |v| crate::advance::encode_verifier_record(v),
        )?;
        self.flush_history_family(
            &mut cache.verifier_history,
            asset_table::VERIFIER_HISTORY,
            |(id, outpoint)| crate::advance::encode_history_key(*id, *outpoint),
            |v: &Vec<u8>| v.clone(),
        )?;
        self.flush_current_family(
            &mut cache.associations,
            asset_table::ASSOCIATION_CURRENT,
            |key| crate::advance::encode_association_key(*key),
            |v| v.to_bytes().to_vec(),
        )?;
        self.flush_history_family(
            &mut cache.association_history,
            asset_table::ASSOCIATION_HISTORY,
            |(key, outpoint)| crate::advance::encode_association_history_key(*key, *outpoint),
            |f| vec![f.to_byte()],
        )?;

        for (height, header) in &cache.pending_headers {
            if let Err(e) = self.header_store.append_header(*height, header) {
                tracing::error!(height, error = %e, "failed to append header");
            }
        }
        if let Err(e) = self
            .header_store
            .append_history(&cache.pending_tx_hashes, &cache.pending_tx_hashxs)
        {
            tracing::error!(error = %e, "failed to append history index");
        }
        if let Err(e) = self.state_store.put_state(state) {
            tracing::error!(error = %e, "failed to persist indexer state");
        }

        cache.clear_all();
        Ok(())
    }

    fn flush_utxo(&self, cache: &mut WriteBackCache) -> Result<(), ChainError> {
        for (key, value) in cache.utxo.puts.drain() {
            let _ = self.utxo_store.put_utxo(&key, &value);
        }
        for key in cache.utxo.deletes.drain(..) {
            let _ = self.utxo_store.delete_utxo(&key);
        }
        self.flush_undo_to_utxo_store(&mut cache.utxo.undo)
    }

    fn flush_undo_to_utxo_store(&self, undo: &mut Vec<(Vec<u8>, u32)>) -> Result<(), ChainError> {
        for (height, payload) in group_by_height(undo) {
            let mut existing = self.utxo_store.get_utxo_undo(height).ok().flatten().unwrap_or_default();
            existing.extend(payload);
            let _ = self.utxo_store.put_utxo_undo(height, &existing);
        }
        undo.clear();
        Ok(())
    }

    /// Asset/h160 id interning: the forward mapping lives in the SUID store;
    /// the undo log (new ids minted per height) lives in the asset store
    /// under its own prefix, since `SuidStore` carries no undo methods.
    fn flush_id_family(&self, cache: &mut WriteBackCache, is_asset: bool) -> Result<(), ChainError> {
        if is_asset {
            for (name, id) in cache.asset_id_intern.puts.drain() {
                let _ = self.suid_store.put_asset_id(&name, id);
            }
            self.flush_undo_to_asset_store(asset_table::ASSET_ID_UNDO, &mut cache.asset_id_intern.undo)
        } else {
            for (h160, id) in cache.h160_id_intern.puts.drain() {
                let _ = self.suid_store.put_h160_id(&h160, id);
            }
            self.flush_undo_to_asset_store(asset_table::H160_ID_UNDO, &mut cache.h160_id_intern.undo)
        }
    }

    fn flush_metadata(&self, cache: &mut WriteBackCache) -> Result<(), ChainError> {
        for (asset_id, meta) in cache.asset_metadata.puts.drain() {
            let encoded = crate::advance::encode_metadata(&meta);
            let _ = self.asset_store.put(asset_table::METADATA, &asset_id.to_le_bytes(), &encoded);
        }
        for asset_id in cache.asset_metadata.deletes.drain(..) {
            let _ = self.asset_store.delete(asset_table::METADATA, &asset_id.to_le_bytes());
        }
        self.flush_undo_to_asset_store(asset_table::METADATA, &mut cache.asset_metadata.undo)
    }

    /// A current-value family: at most one row per key, undo is a plain key
    /// delete (the inverse of whichever put/delete last touched the key).
    fn flush_current_family<K: std::hash::Hash + Eq, V>(
        &self,
        buf: &mut crate::cache::MutationBuffer<K, V>,
        table: &[u8],
        encode_key: impl Fn(&K) -> Vec<u8>,
        encode_value: impl Fn(&V) -> Vec<u8>,
    ) -> Result<(), ChainError> {
        let puts: Vec<(K, V)> = buf.puts.drain().collect();
        for (key, value) in &puts {
            let _ = self.asset_store.put(table, &encode_key(key), &encode_value(value));
        }
        for key in buf.deletes.drain(..) {
            let _ = self.asset_store.delete(table, &encode_key(&key));
        }
        self.flush_undo_to_asset_store(table, &mut buf.undo)
    }

    /// An append-only history family: every row is a fresh key, never
    /// overwritten; undo is a plain key delete.
    fn flush_history_family<K: Clone + std::hash::Hash + Eq, V>(
        &self,
        buf: &mut crate::cache::MutationBuffer<K, V>,
        table: &[u8],
        encode_key: impl Fn(&K) -> Vec<u8>,
        encode_value: impl Fn(&V) -> Vec<u8>,
    ) -> Result<(), ChainError> {
        let puts: Vec<(K, V)> = buf.puts.drain().collect();
        for (key, value) in &puts {
            let _ = self.asset_store.put(table, &encode_key(key), &encode_value(value));
        }
        self.flush_undo_to_asset_store(table, &mut buf.undo)
    }

    fn flush_undo_to_asset_store(&self, table: &[u8], undo: &mut Vec<(Vec<u8>, u32)>) -> Result<(), ChainError> {
        for (height, payload) in group_by_height(undo) {
            let mut existing = self.asset_store.get_undo(table, height).ok().flatten().unwrap_or_default();
            existing.extend(payload);
            let _ = self.asset_store.put_undo(table, height, &existing);
        }
        undo.clear();
        Ok(())
    }
}

/// Concatenates every undo entry's bytes, grouped by height, preserving the
/// append order within each height group — the order the backup engine's
/// reverse-apply families depend on.
fn group_by_height(undo: &[(Vec<u8>, u32)]) -> Vec<(u32, Vec<u8>)> {
    let mut out: Vec<(u32, Vec<u8>)> = Vec::new();
    for (payload, height) in undo {
        match out.iter_mut().find(|(h, _)| h == height) {
            Some((_, bytes)) => bytes.extend_from_slice(payload),
            None => out.push((*height, payload.clone())),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_cache_never_flushes() {
        let cache = WriteBackCache::new();
        let decision = decide(&cache, 100.0, false, 0);
        assert!(!decision.should_flush);
    }

    #[test]
    fn lagging_daemon_forces_flush_even_under_budget() {
        let cache = WriteBackCache::new();
        let decision = decide(&cache, 1_000_000.0, false, 2);
        assert!(decision.should_flush);
    }

    #[test]
    fn processing_blocks_defers_regardless_of_pressure() {
        let mut cache = WriteBackCache::new();
        cache.processing_blocks = true;
        let decision = decide(&cache, 0.0, true, 99);
        assert!(!decision.should_flush);
    }

    #[test]
    fn groups_undo_entries_by_height_preserving_order() {
        let undo = vec![
            (vec![1u8], 10),
            (vec![2u8], 11),
            (vec![3u8], 10),
        ];
        let grouped = group_by_height(&undo);
        let at_10 = grouped.iter().find(|(h, _)| *h == 10).unwrap();
        assert_eq!(at_10.1, vec![1u8, 3u8]);
    }
}
