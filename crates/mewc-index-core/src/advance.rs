//! Advance engine: walks one block's transactions, spends inputs,
//! creates outputs, applies asset effects, and appends undo records.

use std::collections::HashMap;
use std::collections::HashSet;

use mewc_index_common::ChainError;
use mewc_index_common::DeserializeError;
use sha2::Digest;
use sha2::Sha256;

use mewc_index_common::HASHX_LEN;
use mewc_index_common::NULL_U32;

use crate::asset::divisions_is_unchanged;
use crate::asset::is_broadcast_eligible_name;
use crate::asset::recognize;
use crate::asset::AssetBlob;
use crate::asset::Recognized;
use crate::block::CoinParams;
use crate::cache::WriteBackCache;
use crate::state::AssetMetadata;
use crate::state::HashX;
use crate::state::HistoryFlag;
use crate::state::IndexerState;
use crate::state::Outpoint;
use crate::state::UtxoKey;
use crate::state::UtxoValue;
use crate::store::AssetStore;
use crate::store::SuidStore;
use crate::store::UtxoStore;
use crate::tx::Tx;

const OP_RETURN: u8 = 0x6a;

pub fn hash_x(script: &[u8]) -> HashX {
    let digest = Sha256::digest(script);
    let mut out = [0u8; HASHX_LEN];
    out.copy_from_slice(&digest[..HASHX_LEN]);
    out
}

pub fn is_unspendable(script: &[u8], height: u32, coin: &CoinParams) -> bool {
    if script.is_empty() {
        return true;
    }
    if script[0] == OP_RETURN {
        if height >= coin.genesis_activation_height {
            return true;
        }
        return script.len() == 1;
    }
    false
}

/// Outcome of one successful `advance_block` call.
#[derive(Debug, Default)]
pub struct AdvanceOutcome {
    pub reorg_detected: bool,
}

/// Diagnostic sink for malformed scripts, mirroring the optional
/// `invalid_chain_vouts/` dump.
pub trait MalformedScriptSink {
    fn record(&self, height: u32, tag: &str, script: &[u8]);
}

pub struct NullMalformedScriptSink;
impl MalformedScriptSink for NullMalformedScriptSink {
    fn record(&self, _height: u32, _tag: &str, _script: &[u8]) {}
}

pub struct AdvanceEngine<'a, U, A, S, M> {
    pub coin: &'a CoinParams,
    pub utxo_store: &'a U,
    pub asset_store: &'a A,
    pub suid_store: &'a S,
    pub malformed_sink: &'a M,
}

impl<'a, U, A, S, M> AdvanceEngine<'a, U, A, S, M>
where
    U: UtxoStore,
    A: AssetStore,
    S: SuidStore,
    M: MalformedScriptSink,
{
    /// Walk every transaction in `txs`, mutating `state` and `cache` in
    /// place. On a prevhash mismatch this returns `Ok` with
    /// `reorg_detected = true` and performs no mutation.
    pub fn advance_block(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        height: u32,
        block_prevhash: [u8; 32],
        block_header: &[u8],
        raw_block_len: u64,
        txs: &[(Tx, [u8; 32])],
        min_undo_height: u32,
    ) -> Result<AdvanceOutcome, ChainError> {
        if block_prevhash != state.tip {
            return Ok(AdvanceOutcome {
                reorg_detected: true,
            });
        }

        // Undo data is only worth keeping for blocks a reorg could still
        // reach; older blocks drop it to bound undo storage growth.
        let keep_undo = height >= min_undo_height;

        let mut tx_hashxs_this_block = Vec::with_capacity(txs.len());

        for (tx, tx_hash) in txs {
            let tx_num = state.tx_count;
            let is_coinbase = tx.is_coinbase();

            // Step 1: spend inputs, track which asset ids each output
            // hashX's own transaction consumed (for broadcast eligibility).
            let mut input_assets_by_hashx: HashMap<HashX, HashSet<u32>> = HashMap::new();
            if !is_coinbase {
                for input in &tx.inputs {
                    let spent =
                        self.spend_utxo(state, cache, height, keep_undo, input.prev_hash, input.prev_idx)?;
                    cache.touched.hash_x.insert(spent.hash_x);
                    input_assets_by_hashx
                        .entry(spent.hash_x)
                        .or_default()
                        .insert(spent.asset_id);
                }
            }

            // Step 2-3: process outputs.
            let mut restricted_output: Option<(Vec<u8>, Outpoint)> = None;
            let mut pending_verifier: Option<Vec<u8>> = None;
            let mut tx_hashxs = Vec::with_capacity(tx.outputs.len());

            for (vout, output) in tx.outputs.iter().enumerate() {
                let vout = vout as u32;
                if is_unspendable(&output.pk_script, height, self.coin) {
                    continue;
                }

                let outpoint = Outpoint {
                    vout,
                    tx_num,
                };

                match recognize(&output.pk_script, vout) {
                    Recognized::NullAssetTag { h160, name, flag } => {
                        let h160_id = self.intern_h160(state, cache, height, keep_undo, &h160)?;
                        let asset_id = self.intern_asset(state, cache, height, keep_undo, &name)?;
                        self.apply_tag(cache, height, keep_undo, asset_id, h160_id, outpoint, flag);
                        cache.touched.qualifier.insert(name.clone());
                        cache.touched.h160.insert(h160);
                    }
                    Recognized::NullAssetFreeze { name, flag } => {
                        let asset_id = self.intern_asset(state, cache, height, keep_undo, &name)?;
                        self.apply_freeze(cache, height, keep_undo, asset_id, outpoint, flag);
                        cache.touched.frozen_asset.insert(name);
                    }
                    Recognized::NullAssetVerifier { verifier_string } => {
                        pending_verifier = Some(verifier_string);
                    }
                    Recognized::AssetOutput { prefix, blob } => {
                        let hx = hash_x(&prefix);
                        cache.touched.hash_x.insert(hx);
                        let name = blob.name().to_vec();
                        let asset_id = self.intern_asset(state, cache, height, keep_undo, &name)?;
                        cache.touched.asset_name.insert(name.clone());

                        if name.starts_with(b"$") {
                            restricted_output = Some((name.clone(), outpoint));
                        }

                        match &blob {
                            AssetBlob::Ownership(_) => {
                                let meta = AssetMetadata {
                                    total_supply: crate::asset::ownership_supply(),
                                    divisions: 0,
                                    reissuable: false,
                                    associated_data: None,
                                    defining_outpoint: outpoint,
                                    divisions_source: None,
                                    associated_data_source: None,
                                };
                                cache.asset_metadata.put(asset_id, meta);
                                cache.asset_metadata.record_undo_if(
                                    keep_undo,
                                    encode_metadata_undo(asset_id, None),
                                    height,
                                );
                            }
                            AssetBlob::Issuance(issuance) => {
                                let meta = AssetMetadata {
                                    total_supply: issuance.supply,
                                    divisions: issuance.divisions,
                                    reissuable: issuance.reissuable,
                                    associated_data: issuance.associated_data,
                                    defining_outpoint: outpoint,
                                    divisions_source: None,
                                    associated_data_source: None,
                                };
                                cache.asset_metadata.put(asset_id, meta);
                                cache.asset_metadata.record_undo_if(
                                    keep_undo,
                                    encode_metadata_undo(asset_id, None),
                                    height,
                                );
                            }
                            AssetBlob::Reissuance(reissuance) => {
                                let prior = self.read_metadata(cache, asset_id)?;
                                if !prior.reissuable {
                                    return Err(ChainError::NonReissuable {
                                        asset: String::from_utf8_lossy(&name).into_owned(),
                                    });
                                }
                                let new_divisions = if divisions_is_unchanged(reissuance.divisions) {
                                    prior.divisions
                                } else {
                                    reissuance.divisions
                                };
                                let divisions_source = if divisions_is_unchanged(reissuance.divisions) {
                                    prior.divisions_source.or(Some(prior.defining_outpoint))
                                } else {
                                    None
                                };
                                let new_data = reissuance.associated_data.or(prior.associated_data);
                                let data_source = if reissuance.associated_data.is_none() {
                                    prior.associated_data_source.or(Some(prior.defining_outpoint))
                                } else {
                                    None
                                };
                                let new_supply = prior.total_supply + reissuance.supply_delta;

                                cache.asset_metadata_history.put(
                                    (asset_id, outpoint),
                                    prior.clone(),
                                );
                                cache.asset_metadata_history.record_undo_if(
                                    keep_undo,
                                    encode_history_key(asset_id, outpoint),
                                    height,
                                );

                                let new_meta = AssetMetadata {
                                    total_supply: new_supply,
                                    divisions: new_divisions,
                                    reissuable: reissuance.reissuable,
                                    associated_data: new_data,
                                    defining_outpoint: prior.defining_outpoint,
                                    divisions_source,
                                    associated_data_source: data_source,
                                };
                                cache.asset_metadata.record_undo_if(
                                    keep_undo,
                                    encode_metadata_undo(asset_id, Some(&prior)),
                                    height,
                                );
                                cache.asset_metadata.put(asset_id, new_meta);
                            }
                            AssetBlob::Transfer(transfer) => {
                                if is_broadcast_eligible_name(&name) {
                                    if let Some(broadcast) = &transfer.broadcast {
                                        let saw_asset = input_assets_by_hashx
                                            .get(&hx)
                                            .map(|ids| ids.contains(&asset_id))
                                            .unwrap_or(false);
                                        if saw_asset {
                                            let mut payload = Vec::with_capacity(42);
                                            payload.extend_from_slice(&broadcast.data_hash);
                                            if let Some(ts) = broadcast.timestamp {
                                                payload.extend_from_slice(&ts.to_le_bytes());
                                            }
                                            cache.broadcasts.put((asset_id, outpoint), payload);
                                            cache.broadcasts.record_undo_if(
                                                keep_undo,
                                                encode_history_key(asset_id, outpoint),
                                                height,
                                            );
                                            cache.touched.broadcast_asset.insert(name.clone());
                                        }
                                    }
                                }
                            }
                        }

                        let value = UtxoValue {
                            hash_x: hx,
                            tx_num,
                            value: output.value.max(0) as u64,
                            asset_id,
                        };
                        self.emit_utxo(state, cache, UtxoKey {
                            tx_hash: *tx_hash,
                            vout,
                        }, value);
                        tx_hashxs.push(hx);
                        continue;
                    }
                    Recognized::Malformed => {
                        self.malformed_sink.record(height, "malformed_asset_script", &output.pk_script);
                    }
                    Recognized::NoAsset => {}
                }

                // Native-coin (or malformed-as-native) output.
                let hx = hash_x(&output.pk_script);
                cache.touched.hash_x.insert(hx);
                let value = UtxoValue {
                    hash_x: hx,
                    tx_num,
                    value: output.value.max(0) as u64,
                    asset_id: NULL_U32,
                };
                self.emit_utxo(state, cache, UtxoKey { tx_hash: *tx_hash, vout }, value);
                tx_hashxs.push(hx);
            }

            // Step 6: commit a staged verifier only once both a restricted
            // output and a verifier-string output were seen in this tx.
            if let (Some((restricted_name, restricted_outpoint)), Some(verifier_string)) =
                (restricted_output, pending_verifier)
            {
                let restricted_id =
                    self.intern_asset(state, cache, height, keep_undo, &restricted_name)?;
                self.reconcile_verifier(
                    cache,
                    height,
                    keep_undo,
                    restricted_id,
                    restricted_outpoint,
                    tx_num,
                    &verifier_string,
                );
                cache.touched.validator_asset.insert(restricted_name);
            }

            cache.pending_tx_hashes.push(*tx_hash);
            tx_hashxs_this_block.push(tx_hashxs);
            state.tx_count += 1;
        }

        cache.pending_tx_hashxs.extend(tx_hashxs_this_block);
        cache.pending_block_count += 1;

        if height >= min_undo_height {
            // All fourteen families already carry this height's undo
            // entries from the per-mutation calls above; nothing further
            // to tag here beyond marking the block boundary, which the
            // flush coordinator reads off `pending_block_count`.
        }

        state.height = height;
        state.tip = crate::tx::double_sha256(block_header);
        state.chain_size += raw_block_len;

        // Padded to a fixed width so header-file offsets stay height-indexed.
        let mut stored_header = block_header.to_vec();
        stored_header.resize(self.coin.header_len_at(height), 0);
        cache.pending_headers.push((height, stored_header));

        Ok(AdvanceOutcome {
            reorg_detected: false,
        })
    }

    fn spend_utxo(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        prev_hash: [u8; 32],
        prev_idx: u32,
    ) -> Result<UtxoValue, ChainError> {
        let key = UtxoKey {
            tx_hash: prev_hash,
            vout: prev_idx,
        };
        let value = if let Some(v) = cache.utxo.puts.remove(&key) {
            v
        } else {
            self.utxo_store
                .get_utxo(&key)
                .ok()
                .flatten()
                .ok_or(ChainError::UtxoNotFound {
                    tx_hash: prev_hash,
                    vout: prev_idx,
                })?
        };

        cache.utxo.delete(key);
        cache
            .utxo
            .record_undo_if(keep_undo, encode_utxo_value(&value), height);
        state.utxo_count = state.utxo_count.saturating_sub(1);
        Ok(value)
    }

    fn emit_utxo(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        key: UtxoKey,
        value: UtxoValue,
    ) {
        cache.utxo.put(key, value);
        state.utxo_count += 1;
    }

    fn intern_asset(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        name: &[u8],
    ) -> Result<u32, ChainError> {
        if let Some(id) = cache.asset_id_intern.puts.get(name) {
            return Ok(*id);
        }
        if let Some(id) = self.suid_store.asset_to_id(name).ok().flatten() {
            return Ok(id);
        }
        let id = state.asset_count;
        state.asset_count = state
            .asset_count
            .checked_add(1)
            .ok_or(ChainError::IdCounterOverflow)?;
        cache.asset_id_intern.put(name.to_vec(), id);
        cache
            .asset_id_intern
            .record_undo_if(keep_undo, id.to_le_bytes().to_vec(), height);
        Ok(id)
    }

    fn intern_h160(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        h160: &[u8; 20],
    ) -> Result<u32, ChainError> {
        if let Some(id) = cache.h160_id_intern.puts.get(h160) {
            return Ok(*id);
        }
        if let Some(id) = self.suid_store.h160_to_id(h160).ok().flatten() {
            return Ok(id);
        }
        let id = state.h160_count;
        state.h160_count = state
            .h160_count
            .checked_add(1)
            .ok_or(ChainError::IdCounterOverflow)?;
        cache.h160_id_intern.put(*h160, id);
        cache
            .h160_id_intern
            .record_undo_if(keep_undo, id.to_le_bytes().to_vec(), height);
        Ok(id)
    }

    fn read_metadata(
        &self,
        cache: &WriteBackCache,
        asset_id: u32,
    ) -> Result<AssetMetadata, ChainError> {
        if let Some(m) = cache.asset_metadata.puts.get(&asset_id) {
            return Ok(m.clone());
        }
        let bytes = self
            .asset_store
            .get(crate::store::asset_table::METADATA, &asset_id.to_le_bytes())
            .ok()
            .flatten()
            .ok_or(ChainError::NonReissuable {
                asset: format!("id={asset_id}"),
            })?;
        decode_metadata(&bytes).map_err(|_| ChainError::NonReissuable {
            asset: format!("id={asset_id}"),
        })
    }

    fn apply_tag(
        &self,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        asset_id: u32,
        h160_id: u32,
        outpoint: Outpoint,
        flag: u8,
    ) {
        cache.tags.put((asset_id, h160_id), outpoint);
        cache
            .tags
            .record_undo_if(keep_undo, encode_pair_key(asset_id, h160_id), height);
        cache
            .tag_history
            .put((asset_id, h160_id, outpoint), HistoryFlag::from_byte(flag));
        cache.tag_history.record_undo_if(
            keep_undo,
            encode_history_triple(asset_id, h160_id, outpoint),
            height,
        );
    }

    fn apply_freeze(
        &self,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        asset_id: u32,
        outpoint: Outpoint,
        flag: u8,
    ) {
        cache.freezes.put(asset_id, outpoint);
        cache
            .freezes
            .record_undo_if(keep_undo, asset_id.to_le_bytes().to_vec(), height);
        cache
            .freeze_history
            .put((asset_id, outpoint), HistoryFlag::from_byte(flag));
        cache.freeze_history.record_undo_if(
            keep_undo,
            encode_history_key(asset_id, outpoint),
            height,
        );
    }

    /// Looks up the restricted asset's currently-recorded verifier record
    /// (staged this block first, falling back to the store) and reconciles
    /// the qualifier-association set against its string before replacing it
    /// with `new_verifier`.
    fn reconcile_verifier(
        &self,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        restricted_id: u32,
        restricted_outpoint: Outpoint,
        tx_num: u64,
        new_verifier: &[u8],
    ) {
        let prior_record = self.previous_verifier_record(cache, restricted_id);
        let previous_string = prior_record
            .as_ref()
            .and_then(|r| self.verifier_history_string(cache, restricted_id, r.verifier_outpoint));

        let old_qualifiers: HashSet<Vec<u8>> = previous_string
            .as_deref()
            .map(extract_qualifier_tokens)
            .unwrap_or_default();
        let new_qualifiers = extract_qualifier_tokens(new_verifier);

        for removed in old_qualifiers.difference(&new_qualifiers) {
            self.mark_association(
                cache,
                height,
                keep_undo,
                restricted_id,
                removed,
                restricted_outpoint,
                false,
            );
        }
        // Unconditional over the whole new set, not just the diff: re-asserting
        // an already-associated qualifier still needs its own association_history
        // entry and undo record for this block.
        for added in new_qualifiers.iter() {
            self.mark_association(
                cache,
                height,
                keep_undo,
                restricted_id,
                added,
                restricted_outpoint,
                true,
            );
        }

        let verifier_outpoint = Outpoint { vout: 0, tx_num };
        let record = crate::state::VerifierRecord {
            restricted_id,
            restricted_outpoint,
            verifier_outpoint,
            tx_num,
        };

        let undo_payload = match &prior_record {
            Some(r) => {
                let mut out = restricted_id.to_le_bytes().to_vec();
                out.push(1);
                out.extend_from_slice(&encode_verifier_record(r));
                out
            }
            None => {
                let mut out = restricted_id.to_le_bytes().to_vec();
                out.push(0);
                out
            }
        };
        cache.verifiers.record_undo_if(keep_undo, undo_payload, height);
        cache.verifiers.put(restricted_id, record);
        cache
            .verifier_history
            .put((restricted_id, verifier_outpoint), new_verifier.to_vec());
        cache.verifier_history.record_undo_if(
            keep_undo,
            encode_history_key(restricted_id, verifier_outpoint),
            height,
        );
    }

    /// The `VerifierRecord` currently in effect for `restricted_id`, staged
    /// puts taking priority over what is already on disk.
    fn previous_verifier_record(
        &self,
        cache: &WriteBackCache,
        restricted_id: u32,
    ) -> Option<crate::state::VerifierRecord> {
        cache.verifiers.puts.get(&restricted_id).cloned().or_else(|| {
            self.asset_store
                .get(crate::store::asset_table::VERIFIER_CURRENT, &restricted_id.to_le_bytes())
                .ok()
                .flatten()
                .and_then(|bytes| decode_verifier_record(&bytes))
        })
    }

    fn verifier_history_string(
        &self,
        cache: &WriteBackCache,
        restricted_id: u32,
        verifier_outpoint: Outpoint,
    ) -> Option<Vec<u8>> {
        if let Some(v) = cache
            .verifier_history
            .puts
            .get(&(restricted_id, verifier_outpoint))
        {
            return Some(v.clone());
        }
        self.asset_store
            .get(
                crate::store::asset_table::VERIFIER_HISTORY,
                &encode_history_key(restricted_id, verifier_outpoint),
            )
            .ok()
            .flatten()
    }

    /// Resolves `qualifier_name` to an id (interned this block or already on
    /// disk) and flips its association with `restricted_id`. A name that was
    /// never tagged as a qualifier has no id and is silently skipped: a
    /// verifier string can reference free text that was never actually used
    /// to tag anything.
    fn mark_association(
        &self,
        cache: &mut WriteBackCache,
        height: u32,
        keep_undo: bool,
        restricted_id: u32,
        qualifier_token: &[u8],
        outpoint: Outpoint,
        added: bool,
    ) {
        // Verifier-string tokens are bare (`Q`), but qualifier tags are
        // always interned under their `#`-prefixed name.
        let mut qualifier_name = Vec::with_capacity(1 + qualifier_token.len());
        qualifier_name.push(b'#');
        qualifier_name.extend_from_slice(qualifier_token);

        let qualifier_id = cache
            .asset_id_intern
            .puts
            .get(&qualifier_name)
            .copied()
            .or_else(|| self.suid_store.asset_to_id(&qualifier_name).ok().flatten());

        let Some(qualifier_id) = qualifier_id else {
            return;
        };

        let key = crate::state::AssociationKey {
            qualifier_id,
            restricted_id,
        };
        if added {
            cache.associations.put(key, outpoint);
        } else {
            cache.associations.delete(key);
        }
        cache
            .associations
            .record_undo_if(keep_undo, encode_association_key(key), height);
        cache
            .association_history
            .put((key, outpoint), HistoryFlag::from_byte(added as u8));
        cache.association_history.record_undo_if(
            keep_undo,
            encode_association_history_key(key, outpoint),
            height,
        );
        cache.touched.qualifier_association.insert(qualifier_name);
    }
}

fn extract_qualifier_tokens(verifier: &[u8]) -> HashSet<Vec<u8>> {
    let mut out = HashSet::new();
    let mut current = Vec::new();
    for &b in verifier {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
            current.push(b);
        } else if !current.is_empty() {
            out.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.insert(current);
    }
    out
}

pub(crate) const VERIFIER_RECORD_LEN: usize = 4 + Outpoint::LEN + Outpoint::LEN + 5;

/// Reads one verifier-family undo record: `restricted_id (4) || presence (1)
/// || [VerifierRecord if present]`. `None` means the restricted asset had no
/// verifier before this reconciliation (its first one).
pub(crate) fn decode_verifier_undo_entry(
    bytes: &[u8],
    cursor: &mut usize,
) -> Option<(u32, Option<crate::state::VerifierRecord>)> {
    if bytes.len() - *cursor < 5 {
        return None;
    }
    let restricted_id = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().ok()?);
    *cursor += 4;
    let present = bytes[*cursor] != 0;
    *cursor += 1;
    if !present {
        return Some((restricted_id, None));
    }
    if bytes.len() - *cursor < VERIFIER_RECORD_LEN {
        return None;
    }
    let record = decode_verifier_record(&bytes[*cursor..*cursor + VERIFIER_RECORD_LEN])?;
    *cursor += VERIFIER_RECORD_LEN;
    Some((restricted_id, Some(record)))
}

pub fn encode_verifier_record(r: &crate::state::VerifierRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(VERIFIER_RECORD_LEN);
    out.extend_from_slice(&r.restricted_id.to_le_bytes());
    out.extend_from_slice(&r.restricted_outpoint.to_bytes());
    out.extend_from_slice(&r.verifier_outpoint.to_bytes());
    out.extend_from_slice(&r.tx_num.to_le_bytes()[0..5]);
    out
}

pub fn decode_verifier_record(bytes: &[u8]) -> Option<crate::state::VerifierRecord> {
    if bytes.len() != VERIFIER_RECORD_LEN {
        return None;
    }
    let restricted_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let mut off = 4;
    let restricted_outpoint = Outpoint::from_bytes(&bytes[off..off + Outpoint::LEN].try_into().ok()?);
    off += Outpoint::LEN;
    let verifier_outpoint = Outpoint::from_bytes(&bytes[off..off + Outpoint::LEN].try_into().ok()?);
    off += Outpoint::LEN;
    let mut tx_num_bytes = [0u8; 8];
    tx_num_bytes[0..5].copy_from_slice(&bytes[off..off + 5]);
    Some(crate::state::VerifierRecord {
        restricted_id,
        restricted_outpoint,
        verifier_outpoint,
        tx_num: u64::from_le_bytes(tx_num_bytes),
    })
}

pub fn encode_utxo_value(v: &UtxoValue) -> Vec<u8> {
    let mut out = Vec::with_capacity(mewc_index_common::UTXO_VALUE_LEN);
    out.extend_from_slice(&v.hash_x);
    out.extend_from_slice(&v.tx_num.to_le_bytes()[0..5]);
    out.extend_from_slice(&v.value.to_le_bytes());
    out.extend_from_slice(&v.asset_id.to_le_bytes());
    out
}

pub fn decode_utxo_value(bytes: &[u8]) -> Result<UtxoValue, DeserializeError> {
    if bytes.len() != mewc_index_common::UTXO_VALUE_LEN {
        return Err(DeserializeError::Truncated {
            needed: mewc_index_common::UTXO_VALUE_LEN,
            remaining: bytes.len(),
        });
    }
    let mut hash_x = [0u8; HASHX_LEN];
    hash_x.copy_from_slice(&bytes[0..11]);
    let mut tx_num_bytes = [0u8; 8];
    tx_num_bytes[0..5].copy_from_slice(&bytes[11..16]);
    let value = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    let asset_id = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
    Ok(UtxoValue {
        hash_x,
        tx_num: u64::from_le_bytes(tx_num_bytes),
        value,
        asset_id,
    })
}

pub(crate) fn encode_metadata_undo(asset_id: u32, prior: Option<&AssetMetadata>) -> Vec<u8> {
    let mut out = asset_id.to_le_bytes().to_vec();
    match prior {
        None => out.push(0),
        Some(m) => {
            let bytes = encode_metadata(m);
            out.push(bytes.len() as u8);
            out.extend_from_slice(&bytes);
        }
    }
    out
}

/// Reads one `encode_metadata_undo` record starting at `bytes[*cursor]`,
/// advancing the cursor past it. `None` prior means the asset had no
/// metadata before the mutation that produced this record (a fresh
/// issuance): undoing it means deleting the row rather than restoring one.
pub(crate) fn decode_metadata_undo_entry(
    bytes: &[u8],
    cursor: &mut usize,
) -> Result<(u32, Option<AssetMetadata>), DeserializeError> {
    if bytes.len() - *cursor < 5 {
        return Err(DeserializeError::Truncated {
            needed: 5,
            remaining: bytes.len() - *cursor,
        });
    }
    let asset_id = u32::from_le_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap());
    *cursor += 4;
    let len = bytes[*cursor] as usize;
    *cursor += 1;
    if len == 0 {
        return Ok((asset_id, None));
    }
    if bytes.len() - *cursor < len {
        return Err(DeserializeError::Truncated {
            needed: len,
            remaining: bytes.len() - *cursor,
        });
    }
    let meta = decode_metadata(&bytes[*cursor..*cursor + len])?;
    *cursor += len;
    Ok((asset_id, Some(meta)))
}

pub fn encode_metadata(m: &AssetMetadata) -> Vec<u8> {
    let mut out = Vec::with_capacity(48);
    out.extend_from_slice(&m.total_supply.to_le_bytes());
    out.push(m.divisions);
    out.push(m.reissuable as u8);
    out.push(m.associated_data.is_some() as u8);
    if let Some(d) = m.associated_data {
        out.extend_from_slice(&d);
    }
    out.extend_from_slice(&m.defining_outpoint.to_bytes());
    out.push(m.divisions_source.is_some() as u8);
    if let Some(o) = m.divisions_source {
        out.extend_from_slice(&o.to_bytes());
    }
    out.push(m.associated_data_source.is_some() as u8);
    if let Some(o) = m.associated_data_source {
        out.extend_from_slice(&o.to_bytes());
    }
    out
}

pub fn decode_metadata(bytes: &[u8]) -> Result<AssetMetadata, DeserializeError> {
    let mut cur = crate::codec::Cursor::new(bytes);
    let total_supply = cur.read_u64_le()?;
    let divisions = cur.read_bytes(1)?[0];
    let reissuable = cur.read_bytes(1)?[0] != 0;
    let has_data = cur.read_bytes(1)?[0] != 0;
    let associated_data = if has_data {
        Some(cur.read_array::<34>()?)
    } else {
        None
    };
    let defining_outpoint = Outpoint::from_bytes(&cur.read_array::<{ Outpoint::LEN }>()?);
    let has_div_src = cur.read_bytes(1)?[0] != 0;
    let divisions_source = if has_div_src {
        Some(Outpoint::from_bytes(&cur.read_array::<{ Outpoint::LEN }>()?))
    } else {
        None
    };
    let has_data_src = cur.read_bytes(1)?[0] != 0;
    let associated_data_source = if has_data_src {
        Some(Outpoint::from_bytes(&cur.read_array::<{ Outpoint::LEN }>()?))
    } else {
        None
    };
    Ok(AssetMetadata {
        total_supply,
        divisions,
        reissuable,
        associated_data,
        defining_outpoint,
        divisions_source,
        associated_data_source,
    })
}

pub(crate) fn encode_history_key(asset_id: u32, outpoint: Outpoint) -> Vec<u8> {
    let mut out = asset_id.to_le_bytes().to_vec();
    out.extend_from_slice(&outpoint.to_bytes());
    out
}

pub(crate) fn decode_history_key(bytes: &[u8]) -> Option<(u32, Outpoint)> {
    if bytes.len() != 4 + Outpoint::LEN {
        return None;
    }
    let asset_id = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let outpoint = Outpoint::from_bytes(&bytes[4..4 + Outpoint::LEN].try_into().ok()?);
    Some((asset_id, outpoint))
}

pub(crate) fn encode_pair_key(a: u32, b: u32) -> Vec<u8> {
    let mut out = a.to_le_bytes().to_vec();
    out.extend_from_slice(&b.to_le_bytes());
    out
}

pub(crate) fn decode_pair_key(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() != 8 {
        return None;
    }
    let a = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
    let b = u32::from_le_bytes(bytes[4..8].try_into().ok()?);
    Some((a, b))
}

pub(crate) fn encode_history_triple(a: u32, b: u32, outpoint: Outpoint) -> Vec<u8> {
    let mut out = encode_pair_key(a, b);
    out.extend_from_slice(&outpoint.to_bytes());
    out
}

pub(crate) fn decode_history_triple(bytes: &[u8]) -> Option<(u32, u32, Outpoint)> {
    if bytes.len() != 8 + Outpoint::LEN {
        return None;
    }
    let (a, b) = decode_pair_key(&bytes[0..8])?;
    let outpoint = Outpoint::from_bytes(&bytes[8..8 + Outpoint::LEN].try_into().ok()?);
    Some((a, b, outpoint))
}

pub(crate) fn encode_association_key(key: crate::state::AssociationKey) -> Vec<u8> {
    encode_pair_key(key.qualifier_id, key.restricted_id)
}

pub(crate) fn decode_association_key(bytes: &[u8]) -> Option<crate::state::AssociationKey> {
    let (qualifier_id, restricted_id) = decode_pair_key(bytes)?;
    Some(crate::state::AssociationKey {
        qualifier_id,
        restricted_id,
    })
}

pub(crate) fn encode_association_history_key(key: crate::state::AssociationKey, outpoint: Outpoint) -> Vec<u8> {
    let mut out = encode_association_key(key);
    out.extend_from_slice(&outpoint.to_bytes());
    out
}

pub(crate) fn decode_association_history_key(
    bytes: &[u8],
) -> Option<(crate::state::AssociationKey, Outpoint)> {
    if bytes.len() != 8 + Outpoint::LEN {
        return None;
    }
    let key = decode_association_key(&bytes[0..8])?;
    let outpoint = Outpoint::from_bytes(&bytes[8..8 + Outpoint::LEN].try_into().ok()?);
    Some((key, outpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::OP_MEWC_ASSET;
    use crate::asset::OP_RESERVED;
    use crate::codec::write_varbytes;
    use crate::tx::double_sha256;
    use mewc_index_common::consts::ASSET_MAGIC;
    use mewc_index_common::consts::DIVISIONS_UNCHANGED;

    fn coin() -> CoinParams {
        CoinParams {
            static_header_len: 80,
            auxpow_activation_height: 1_000_000,
            kawpow_activation_height: 1_000_000,
            genesis_activation_height: 0,
            prefetch_limit: 8,
            avg_block_size: 512 * 1024,
        }
    }

    #[derive(Debug)]
    struct FakeErr;
    impl std::fmt::Display for FakeErr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error")
        }
    }
    impl std::error::Error for FakeErr {}

    /// Every store call in `advance_block` is a cache-miss fallback; tests
    /// drive state purely through one shared `WriteBackCache` across
    /// multiple `advance_block` calls, so the backing stores are never
    /// actually consulted for data written earlier in the same test.
    struct EmptyStore;

    impl UtxoStore for EmptyStore {
        type Error = FakeErr;
        fn get_utxo(&self, _key: &UtxoKey) -> Result<Option<UtxoValue>, Self::Error> {
            Ok(None)
        }
        fn put_utxo(&self, _key: &UtxoKey, _value: &UtxoValue) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_utxo(&self, _key: &UtxoKey) -> Result<(), Self::Error> {
            Ok(())
        }
        fn get_utxo_undo(&self, _height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(None)
        }
        fn put_utxo_undo(&self, _height: u32, _payload: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_utxo_undo(&self, _height: u32) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl AssetStore for EmptyStore {
        type Error = FakeErr;
        fn get(&self, _table_prefix: &[u8], _key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(None)
        }
        fn put(&self, _table_prefix: &[u8], _key: &[u8], _value: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete(&self, _table_prefix: &[u8], _key: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn get_undo(&self, _table_prefix: &[u8], _height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(None)
        }
        fn put_undo(&self, _table_prefix: &[u8], _height: u32, _payload: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_undo(&self, _table_prefix: &[u8], _height: u32) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl SuidStore for EmptyStore {
        type Error = FakeErr;
        fn asset_to_id(&self, _name: &[u8]) -> Result<Option<u32>, Self::Error> {
            Ok(None)
        }
        fn id_to_asset(&self, _id: u32) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(None)
        }
        fn put_asset_id(&self, _name: &[u8], _id: u32) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_asset_id(&self, _name: &[u8], _id: u32) -> Result<(), Self::Error> {
            Ok(())
        }
        fn h160_to_id(&self, _h160: &[u8; 20]) -> Result<Option<u32>, Self::Error> {
            Ok(None)
        }
        fn id_to_h160(&self, _id: u32) -> Result<Option<[u8; 20]>, Self::Error> {
            Ok(None)
        }
        fn put_h160_id(&self, _h160: &[u8; 20], _id: u32) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_h160_id(&self, _h160: &[u8; 20], _id: u32) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingMalformedSink {
        calls: std::cell::RefCell<Vec<(u32, String)>>,
    }

    impl MalformedScriptSink for RecordingMalformedSink {
        fn record(&self, height: u32, tag: &str, _script: &[u8]) {
            self.calls.borrow_mut().push((height, tag.to_string()));
        }
    }

    fn engine<'a>(
        coin: &'a CoinParams,
        store: &'a EmptyStore,
        sink: &'a RecordingMalformedSink,
    ) -> AdvanceEngine<'a, EmptyStore, EmptyStore, EmptyStore, RecordingMalformedSink> {
        AdvanceEngine {
            coin,
            utxo_store: store,
            asset_store: store,
            suid_store: store,
            malformed_sink: sink,
        }
    }

    fn push(out: &mut Vec<u8>, data: &[u8]) {
        assert!(data.len() < 0x4c);
        out.push(data.len() as u8);
        out.extend_from_slice(data);
    }

    fn pay_to_script(tag: u8) -> Vec<u8> {
        vec![0x76, 0xa9, tag, 0x88, 0xac]
    }

    fn coinbase_tx(value: i64, out_script: &[u8]) -> (Tx, [u8; 32]) {
        let tx = Tx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash: [0u8; 32],
                prev_idx: mewc_index_common::MINUS_1,
                script: b"coinbase".to_vec(),
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOutput {
                value,
                pk_script: out_script.to_vec(),
            }],
            locktime: 0,
            witness: None,
        };
        let hash = double_sha256(b"coinbase-tx-marker");
        (tx, hash)
    }

    fn spending_tx(prev_hash: [u8; 32], prev_idx: u32, outputs: Vec<TxOutput>, tx_marker: u8) -> (Tx, [u8; 32]) {
        let tx = Tx {
            version: 1,
            inputs: vec![TxInput {
                prev_hash,
                prev_idx,
                script: Vec::new(),
                sequence: 0xFFFF_FFFF,
            }],
            outputs,
            locktime: 0,
            witness: None,
        };
        let hash = double_sha256(&[tx_marker]);
        (tx, hash)
    }

    fn asset_blob(script_type: u8, name: &[u8], fields: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        blob.extend_from_slice(&ASSET_MAGIC);
        blob.push(script_type);
        write_varbytes(&mut blob, name);
        blob.extend_from_slice(fields);
        blob
    }

    fn asset_output_script(prefix: &[u8], blob: &[u8]) -> Vec<u8> {
        let mut script = prefix.to_vec();
        script.push(OP_MEWC_ASSET);
        push(&mut script, blob);
        script
    }

    fn header_for(marker: u8) -> Vec<u8> {
        vec![marker; 80]
    }

    // S1 -- coinbase-only block: one coinbase tx with one output, no asset
    // activity. state.height advances, one UTXO is created, and only the
    // output's hashX is touched.
    #[test]
    fn s1_coinbase_only_block_creates_one_utxo() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let out_script = pay_to_script(0xAA);
        let txs = vec![coinbase_tx(50_0000_0000, &out_script)];
        let header = header_for(1);

        let outcome = engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header, header.len() as u64, &txs, 1)
            .unwrap();

        assert!(!outcome.reorg_detected);
        assert_eq!(state.height, 1);
        assert_eq!(cache.utxo.puts.len(), 1);
        assert_eq!(cache.touched.hash_x.len(), 1);
        assert!(cache.asset_metadata.is_empty());
        assert!(cache.utxo.undo.is_empty(), "coinbase has no inputs to undo");
    }

    // S2 -- new asset issuance: a `q`-type output creates asset FOO.
    #[test]
    fn s2_issuance_creates_metadata_and_touches_name() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let funding_script = pay_to_script(0x01);
        let funding_tx = coinbase_tx(50_0000_0000, &funding_script);
        let funding_hash = funding_tx.1;
        let header1 = header_for(1);
        engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header1, header1.len() as u64, &[funding_tx], 1)
            .unwrap();
        let tip1 = state.tip;

        let mut fields = Vec::new();
        fields.extend_from_slice(&1000u64.to_le_bytes());
        fields.push(0); // divisions
        fields.push(1); // reissuable
        fields.push(0); // no associated data
        let blob = asset_blob(b'q', b"FOO", &fields);
        let issuance_script = asset_output_script(&pay_to_script(0x02), &blob);

        let tx = spending_tx(funding_hash, 0, vec![TxOutput { value: 0, pk_script: issuance_script }], 1);
        let header2 = header_for(2);
        engine
            .advance_block(&mut state, &mut cache, 2, tip1, &header2, header2.len() as u64, &[tx], 1)
            .unwrap();

        assert_eq!(state.asset_count, 1);
        assert!(cache.touched.asset_name.contains(b"FOO".as_slice()));
        let meta = cache.asset_metadata.puts.get(&0).expect("asset id 0 metadata");
        assert_eq!(meta.total_supply, 1000);
        assert_eq!(meta.divisions, 0);
        assert!(meta.reissuable);
        assert_eq!(meta.associated_data, None);
    }

    // S3 -- reissuance preserving unchanged fields: supply accumulates,
    // divisions and associated data inherit from the prior record when the
    // reissuance blob's divisions byte is DIVISIONS_UNCHANGED and no ipfs
    // bytes follow.
    #[test]
    fn s3_reissuance_preserves_divisions_and_data() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let funding_tx = coinbase_tx(50_0000_0000, &pay_to_script(0x01));
        let funding_hash = funding_tx.1;
        let header1 = header_for(1);
        engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header1, header1.len() as u64, &[funding_tx], 1)
            .unwrap();
        let tip1 = state.tip;

        let associated_data = [0xAAu8; 34];
        let mut issuance_fields = Vec::new();
        issuance_fields.extend_from_slice(&1000u64.to_le_bytes());
        issuance_fields.push(2); // divisions
        issuance_fields.push(1); // reissuable
        issuance_fields.push(1); // has associated data
        issuance_fields.extend_from_slice(&associated_data);
        let issuance_blob = asset_blob(b'q', b"FOO", &issuance_fields);
        let issuance_script = asset_output_script(&pay_to_script(0x02), &issuance_blob);
        let issuance_tx = spending_tx(funding_hash, 0, vec![TxOutput { value: 0, pk_script: issuance_script }], 1);
        let issuance_hash = issuance_tx.1;
        let header2 = header_for(2);
        engine
            .advance_block(&mut state, &mut cache, 2, tip1, &header2, header2.len() as u64, &[issuance_tx], 1)
            .unwrap();
        let tip2 = state.tip;

        let mut reissue_fields = Vec::new();
        reissue_fields.extend_from_slice(&500u64.to_le_bytes());
        reissue_fields.push(DIVISIONS_UNCHANGED);
        reissue_fields.push(1); // still reissuable
        let reissue_blob = asset_blob(b'r', b"FOO", &reissue_fields);
        let reissue_script = asset_output_script(&pay_to_script(0x03), &reissue_blob);
        let reissue_tx = spending_tx(issuance_hash, 0, vec![TxOutput { value: 0, pk_script: reissue_script }], 2);
        let header3 = header_for(3);
        engine
            .advance_block(&mut state, &mut cache, 3, tip2, &header3, header3.len() as u64, &[reissue_tx], 1)
            .unwrap();

        let meta = cache.asset_metadata.puts.get(&0).expect("asset id 0 metadata");
        assert_eq!(meta.total_supply, 1500);
        assert_eq!(meta.divisions, 2);
        assert_eq!(meta.associated_data, Some(associated_data));
        assert!(meta.reissuable);
    }

    // Regression test for the reissuable byte being read fresh off the wire
    // rather than carried forward from the prior record: a reissuance that
    // sets reissuable=0 permanently finalizes the asset.
    #[test]
    fn reissuance_reads_fresh_reissuable_byte_and_finalizes() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let funding_tx = coinbase_tx(50_0000_0000, &pay_to_script(0x01));
        let funding_hash = funding_tx.1;
        let header1 = header_for(1);
        engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header1, header1.len() as u64, &[funding_tx], 1)
            .unwrap();
        let tip1 = state.tip;

        let mut issuance_fields = Vec::new();
        issuance_fields.extend_from_slice(&1000u64.to_le_bytes());
        issuance_fields.push(0);
        issuance_fields.push(1); // reissuable
        issuance_fields.push(0);
        let issuance_blob = asset_blob(b'q', b"FOO", &issuance_fields);
        let issuance_script = asset_output_script(&pay_to_script(0x02), &issuance_blob);
        let issuance_tx = spending_tx(funding_hash, 0, vec![TxOutput { value: 0, pk_script: issuance_script }], 1);
        let issuance_hash = issuance_tx.1;
        let header2 = header_for(2);
        engine
            .advance_block(&mut state, &mut cache, 2, tip1, &header2, header2.len() as u64, &[issuance_tx], 1)
            .unwrap();
        let tip2 = state.tip;

        let mut finalize_fields = Vec::new();
        finalize_fields.extend_from_slice(&0u64.to_le_bytes());
        finalize_fields.push(DIVISIONS_UNCHANGED);
        finalize_fields.push(0); // reissuable = false: finalize the asset
        let finalize_blob = asset_blob(b'r', b"FOO", &finalize_fields);
        let finalize_script = asset_output_script(&pay_to_script(0x03), &finalize_blob);
        let finalize_tx = spending_tx(issuance_hash, 0, vec![TxOutput { value: 0, pk_script: finalize_script }], 2);
        let header3 = header_for(3);
        engine
            .advance_block(&mut state, &mut cache, 3, tip2, &header3, header3.len() as u64, &[finalize_tx], 1)
            .unwrap();

        let meta = cache.asset_metadata.puts.get(&0).expect("asset id 0 metadata");
        assert!(!meta.reissuable, "the freshly-read reissuable=0 byte must stick, not the prior true");
    }

    // S4 -- qualifier tag then verifier: tagging H with #Q, then issuing a
    // restricted asset $R with verifier string "Q" in a later block, must
    // create the association between #Q and $R.
    #[test]
    fn s4_qualifier_tag_then_verifier_creates_association() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let funding_tx = coinbase_tx(50_0000_0000, &pay_to_script(0x01));
        let funding_hash = funding_tx.1;
        let header1 = header_for(1);
        engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header1, header1.len() as u64, &[funding_tx], 1)
            .unwrap();
        let tip1 = state.tip;

        // Block N: tag H with qualifier #Q at vout 0.
        let h160 = [0x11u8; 20];
        let mut tag_payload = Vec::new();
        write_varbytes(&mut tag_payload, b"#Q");
        tag_payload.push(1); // flag = set
        let mut tag_script = Vec::new();
        tag_script.push(OP_MEWC_ASSET);
        push(&mut tag_script, &h160);
        push(&mut tag_script, &tag_payload);
        let tag_tx = spending_tx(funding_hash, 0, vec![TxOutput { value: 0, pk_script: tag_script }], 1);
        let tag_tx_hash = tag_tx.1;
        let header2 = header_for(2);
        engine
            .advance_block(&mut state, &mut cache, 2, tip1, &header2, header2.len() as u64, &[tag_tx], 1)
            .unwrap();
        let tip2 = state.tip;

        // Block N+1: one tx with vout 0 = verifier string "Q", vout 1 =
        // restricted asset issuance for $R.
        let mut verifier_script = Vec::new();
        verifier_script.push(OP_MEWC_ASSET);
        verifier_script.push(OP_RESERVED);
        push(&mut verifier_script, b"Q");

        let mut restricted_fields = Vec::new();
        restricted_fields.extend_from_slice(&1000u64.to_le_bytes());
        restricted_fields.push(0);
        restricted_fields.push(1);
        restricted_fields.push(0);
        let restricted_blob = asset_blob(b'q', b"$R", &restricted_fields);
        let restricted_script = asset_output_script(&pay_to_script(0x04), &restricted_blob);

        let outputs = vec![
            TxOutput { value: 0, pk_script: verifier_script },
            TxOutput { value: 0, pk_script: restricted_script },
        ];
        let verifier_tx = spending_tx(tag_tx_hash, 0, outputs, 2);
        let header3 = header_for(3);
        engine
            .advance_block(&mut state, &mut cache, 3, tip2, &header3, header3.len() as u64, &[verifier_tx], 1)
            .unwrap();

        assert!(cache.touched.validator_asset.contains(b"$R".as_slice()));
        assert!(cache.touched.qualifier_association.contains(b"#Q".as_slice()));
        assert_eq!(cache.associations.puts.len(), 1);
        let key = cache.associations.puts.keys().next().copied().unwrap();
        let qualifier_id = cache.asset_id_intern.puts.get(b"#Q".as_slice()).copied().unwrap();
        let restricted_id = cache.asset_id_intern.puts.get(b"$R".as_slice()).copied().unwrap();
        assert_eq!(key.qualifier_id, qualifier_id);
        assert_eq!(key.restricted_id, restricted_id);
    }

    // S6 -- malformed script tolerance: a push claiming more bytes than
    // present must not abort the block; the output is hashed as-is with
    // NULL_U32 asset id, and the malformed sink is notified.
    #[test]
    fn s6_malformed_script_falls_back_to_null_asset_utxo() {
        let coin = coin();
        let store = EmptyStore;
        let sink = RecordingMalformedSink::default();
        let engine = engine(&coin, &store, &sink);

        let mut state = IndexerState::default();
        let mut cache = WriteBackCache::new();

        let funding_tx = coinbase_tx(50_0000_0000, &pay_to_script(0x01));
        let funding_hash = funding_tx.1;
        let header1 = header_for(1);
        engine
            .advance_block(&mut state, &mut cache, 1, [0u8; 32], &header1, header1.len() as u64, &[funding_tx], 1)
            .unwrap();
        let tip1 = state.tip;

        let mut malformed_script = pay_to_script(0x05);
        malformed_script.push(OP_MEWC_ASSET);
        malformed_script.push(b"not an asset blob at all".len() as u8);
        malformed_script.extend_from_slice(b"not an asset blob at all");

        let tx = spending_tx(funding_hash, 0, vec![TxOutput { value: 777, pk_script: malformed_script }], 1);
        let header2 = header_for(2);
        engine
            .advance_block(&mut state, &mut cache, 2, tip1, &header2, header2.len() as u64, &[tx], 1)
            .unwrap();

        assert_eq!(sink.calls.borrow().len(), 1);
        assert_eq!(sink.calls.borrow()[0].1, "malformed_asset_script");
        let (_, value) = cache.utxo.puts.iter().find(|(k, _)| k.vout == 0).unwrap();
        assert_eq!(value.asset_id, NULL_U32);
        assert_eq!(value.value, 777);
    }
}
