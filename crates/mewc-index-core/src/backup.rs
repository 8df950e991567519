//! Backup engine: reverses one already-advanced block's effects using the
//! undo records the advance engine appended, replaying all fourteen
//! mutation families in one pass. Used only by the reorg driver, never on
//! the normal forward path.
//!
//! Reads assume the flush coordinator persists each family's undo records
//! for a height as one blob per `(table_prefix, height)`, each entry's bytes
//! appended in the order the advance engine recorded them. Value-restoring
//! families (asset metadata, verifiers) are replayed back-to-front so the
//! chronologically first mutation's prior value — the true pre-block state —
//! is the last one applied.

use std::time::Duration;

use mewc_index_common::ChainError;

use crate::advance::decode_association_history_key;
use crate::advance::decode_association_key;
use crate::advance::decode_history_key;
use crate::advance::decode_history_triple;
use crate::advance::decode_metadata_undo_entry;
use crate::advance::decode_pair_key;
use crate::advance::decode_verifier_undo_entry;
use crate::cache::WriteBackCache;
use crate::state::IndexerState;
use crate::state::UtxoKey;
use crate::store::asset_table;
use crate::store::AssetStore;
use crate::store::SuidStore;
use crate::store::UtxoStore;
use crate::tx::Tx;

const UNDO_RETRY_ATTEMPTS: u32 = 5;
const UNDO_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct BackupEngine<'a, U, A, S> {
    pub utxo_store: &'a U,
    pub asset_store: &'a A,
    pub suid_store: &'a S,
}

impl<'a, U, A, S> BackupEngine<'a, U, A, S>
where
    U: UtxoStore,
    A: AssetStore,
    S: SuidStore,
{
    /// Undo the block at `height`, restoring `state` and `cache` to what
    /// they were just before that block was advanced. `txs_reversed` must be
    /// the block's transactions in reverse order (`OnDiskBlock::iter_txs_reversed`),
    /// and `block_header` the same raw header `advance_block` was given for
    /// this height. The caller must guarantee `cache.is_flushed()` — undoing
    /// against a dirty cache would silently drop pending writes.
    pub async fn backup_block(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        height: u32,
        block_header: &[u8],
        raw_block_len: u64,
        txs_reversed: &[(Tx, [u8; 32])],
    ) -> Result<(), ChainError> {
        debug_assert!(cache.is_flushed(), "backup_block requires a flushed cache");
        assert!(height > 0, "genesis has no undo history");

        let undo_bytes = self.read_undo_with_retry(height).await?;
        let mut remaining = undo_bytes.len();

        for (tx, tx_hash) in txs_reversed {
            for vout in 0..tx.outputs.len() as u32 {
                cache.utxo.delete(UtxoKey {
                    tx_hash: *tx_hash,
                    vout,
                });
                state.utxo_count = state.utxo_count.saturating_sub(1);
            }

            if tx.is_coinbase() {
                continue;
            }

            for input in tx.inputs.iter().rev() {
                if remaining < mewc_index_common::UTXO_VALUE_LEN {
                    return Err(ChainError::UndoLengthMismatch { height, remaining });
                }
                remaining -= mewc_index_common::UTXO_VALUE_LEN;
                let value_bytes = &undo_bytes[remaining..remaining + mewc_index_common::UTXO_VALUE_LEN];
                let value = crate::advance::decode_utxo_value(value_bytes).map_err(ChainError::Deserialize)?;
                cache.utxo.put(
                    UtxoKey {
                        tx_hash: input.prev_hash,
                        vout: input.prev_idx,
                    },
                    value,
                );
                state.utxo_count += 1;
            }

            state.tx_count = state.tx_count.saturating_sub(1);
        }

        if remaining != 0 {
            return Err(ChainError::UndoLengthMismatch { height, remaining });
        }

        self.undo_id_family(state, asset_table::ASSET_ID_UNDO, height, true)?;
        self.undo_id_family(state, asset_table::H160_ID_UNDO, height, false)?;

        self.undo_metadata_family(height)?;
        self.undo_delete_only(height, asset_table::METADATA_HISTORY, decode_history_key_flat)?;
        self.undo_delete_only(height, asset_table::BROADCAST, decode_history_key_flat)?;
        self.undo_delete_only(height, asset_table::ASSET_TAG_CURRENT, decode_pair_key_flat)?;
        self.undo_delete_only(height, asset_table::ASSET_TAG_HISTORY, decode_history_triple_flat)?;
        self.undo_delete_only(height, asset_table::FREEZE_CURRENT, decode_u32_key_flat)?;
        self.undo_delete_only(height, asset_table::FREEZE_HISTORY, decode_history_key_flat)?;
        self.undo_delete_only(
            height,
            asset_table::VERIFIER_HISTORY,
            decode_history_key_flat,
        )?;
        self.undo_verifier_family(height)?;
        self.undo_delete_only(
            height,
            asset_table::ASSOCIATION_CURRENT,
            decode_association_key_flat,
        )?;
        self.undo_delete_only(
            height,
            asset_table::ASSOCIATION_HISTORY,
            decode_association_history_key_flat,
        )?;

        let prev_hash: [u8; 32] = block_header
            .get(4..36)
            .and_then(|s| s.try_into().ok())
            .unwrap_or([0u8; 32]);
        state.height = height - 1;
        state.tip = prev_hash;
        state.chain_size = state.chain_size.saturating_sub(raw_block_len);

        Ok(())
    }

    async fn read_undo_with_retry(&self, height: u32) -> Result<Vec<u8>, ChainError> {
        for attempt in 0..UNDO_RETRY_ATTEMPTS {
            if let Some(bytes) = self
                .utxo_store
                .get_utxo_undo(height)
                .map_err(|_| ChainError::NoUndoInfo { height })?
            {
                return Ok(bytes);
            }
            if attempt + 1 < UNDO_RETRY_ATTEMPTS {
                tokio::time::sleep(UNDO_RETRY_DELAY).await;
            }
        }
        Err(ChainError::NoUndoInfo { height })
    }

    /// Newly-minted ids at `height` form a contiguous suffix of the id
    /// counter; this is asserted rather than tolerated, since a gap would
    /// mean interning order was corrupted upstream. Each id's name/h160 is
    /// recovered from the SUID store (the only place that mapping lives)
    /// and removed from it, and the matching counter is decremented.
    fn undo_id_family(
        &self,
        state: &mut IndexerState,
        table: &[u8],
        height: u32,
        is_asset: bool,
    ) -> Result<(), ChainError> {
        let bytes = self
            .asset_store
            .get_undo(table, height)
            .ok()
            .flatten()
            .unwrap_or_default();
        if bytes.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        ids.sort_unstable();

        let counter = if is_asset { state.asset_count } else { state.h160_count };
        let expected_min = counter
            .checked_sub(ids.len() as u32)
            .ok_or(ChainError::NonContiguousIdUndo {
                height,
                counter,
                ids: ids.len(),
            })?;
        for (offset, id) in ids.iter().enumerate() {
            if *id != expected_min + offset as u32 {
                return Err(ChainError::NonContiguousIdUndo {
                    height,
                    counter,
                    ids: ids.len(),
                });
            }
        }

        for id in &ids {
            if is_asset {
                if let Some(name) = self.suid_store.id_to_asset(*id).ok().flatten() {
                    let _ = self.suid_store.delete_asset_id(&name, *id);
                }
            } else if let Some(h160) = self.suid_store.id_to_h160(*id).ok().flatten() {
                let _ = self.suid_store.delete_h160_id(&h160, *id);
            }
        }

        if is_asset {
            state.asset_count = expected_min;
        } else {
            state.h160_count = expected_min;
        }
        Ok(())
    }

    /// Replays the metadata undo log in reverse-append order: the first
    /// mutation recorded this block captured the true pre-block value, so it
    /// must be the last one applied.
    fn undo_metadata_family(&self, height: u32) -> Result<(), ChainError> {
        let bytes = self
            .asset_store
            .get_undo(asset_table::METADATA, height)
            .ok()
            .flatten()
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            entries.push(decode_metadata_undo_entry(&bytes, &mut cursor).map_err(ChainError::Deserialize)?);
        }

        for (asset_id, prior) in entries.into_iter().rev() {
            match prior {
                None => {
                    let _ = self.asset_store.delete(asset_table::METADATA, &asset_id.to_le_bytes());
                }
                Some(meta) => {
                    let encoded = crate::advance::encode_metadata(&meta);
                    let _ = self
                        .asset_store
                        .put(asset_table::METADATA, &asset_id.to_le_bytes(), &encoded);
                }
            }
        }
        Ok(())
    }

    /// Same reverse-apply discipline as metadata, for the verifier-current
    /// family.
    fn undo_verifier_family(&self, height: u32) -> Result<(), ChainError> {
        let bytes = self
            .asset_store
            .get_undo(asset_table::VERIFIER_CURRENT, height)
            .ok()
            .flatten()
            .unwrap_or_default();

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            match decode_verifier_undo_entry(&bytes, &mut cursor) {
                Some(e) => entries.push(e),
                None => break,
            }
        }

        for (restricted_id, prior) in entries.into_iter().rev() {
            match prior {
                None => {
                    let _ = self
                        .asset_store
                        .delete(asset_table::VERIFIER_CURRENT, &restricted_id.to_le_bytes());
                }
                Some(record) => {
                    let encoded = crate::advance::encode_verifier_record(&record);
                    let _ = self.asset_store.put(
                        asset_table::VERIFIER_CURRENT,
                        &restricted_id.to_le_bytes(),
                        &encoded,
                    );
                }
            }
        }
        Ok(())
    }

    /// Generic replay for a family whose undo log is just a sequence of keys
    /// to delete (history rows are append-only; current-value rows like tags
    /// and freezes carry only one value per key, so removing the key is the
    /// correct inverse of the put that created or last moved it).
    fn undo_delete_only(
        &self,
        height: u32,
        table: &[u8],
        decode_key: fn(&[u8]) -> Option<Vec<u8>>,
    ) -> Result<(), ChainError> {
        let bytes = self
            .asset_store
            .get_undo(table, height)
            .ok()
            .flatten()
            .unwrap_or_default();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let Some(key) = decode_key(&bytes[cursor..]) else {
                break;
            };
            cursor += key.len();
            let _ = self.asset_store.delete(table, &key);
        }
        Ok(())
    }
}

fn decode_history_key_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    const LEN: usize = 4 + crate::state::Outpoint::LEN;
    if bytes.len() < LEN {
        return None;
    }
    decode_history_key(&bytes[..LEN])?;
    Some(bytes[..LEN].to_vec())
}

fn decode_pair_key_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    const LEN: usize = 8;
    if bytes.len() < LEN {
        return None;
    }
    decode_pair_key(&bytes[..LEN])?;
    Some(bytes[..LEN].to_vec())
}

fn decode_history_triple_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    const LEN: usize = 8 + crate::state::Outpoint::LEN;
    if bytes.len() < LEN {
        return None;
    }
    decode_history_triple(&bytes[..LEN])?;
    Some(bytes[..LEN].to_vec())
}

fn decode_u32_key_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    if bytes.len() < 4 {
        return None;
    }
    Some(bytes[..4].to_vec())
}

fn decode_association_key_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    const LEN: usize = 8;
    if bytes.len() < LEN {
        return None;
    }
    decode_association_key(&bytes[..LEN])?;
    Some(bytes[..LEN].to_vec())
}

fn decode_association_history_key_flat(bytes: &[u8]) -> Option<Vec<u8>> {
    const LEN: usize = 8 + crate::state::Outpoint::LEN;
    if bytes.len() < LEN {
        return None;
    }
    decode_association_history_key(&bytes[..LEN])?;
    Some(bytes[..LEN].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_key_flat_round_trips_length() {
        let outpoint = crate::state::Outpoint { vout: 1, tx_num: 2 };
        let mut bytes = crate::advance::encode_history_key(7, outpoint);
        bytes.extend_from_slice(&[0xAA; 4]); // trailing garbage from a second entry
        let decoded = decode_history_key_flat(&bytes).unwrap();
        assert_eq!(decoded.len(), 4 + crate::state::Outpoint::LEN);
    }

    #[test]
    fn pair_key_flat_round_trips_length() {
        let bytes = crate::advance::encode_pair_key(3, 9);
        let decoded = decode_pair_key_flat(&bytes).unwrap();
        assert_eq!(decoded, bytes);
    }
}
