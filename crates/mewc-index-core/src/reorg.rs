//! Reorg driver: locates the common ancestor with the daemon (or accepts a
//! caller-supplied simulated-reorg depth), flushes and clears the cache, then
//! walks backup_block across the divergent range in reverse.

use std::path::Path;
use std::sync::Arc;

use mewc_index_common::ChainError;
use tokio::sync::Notify;

use crate::backup::BackupEngine;
use crate::block::CoinParams;
use crate::block::OnDiskBlock;
use crate::cache::WriteBackCache;
use crate::flush::FlushCoordinator;
use crate::prefetch::Prefetcher;
use crate::state::IndexerState;
use crate::store::AssetStore;
use crate::store::DaemonRpc;
use crate::store::HeaderStore;
use crate::store::StateStore;
use crate::store::SuidStore;
use crate::store::UtxoStore;
use crate::tx::double_sha256;

/// Block hash display convention: reversed-byte hex, matching the daemon's
/// `block_hex_hashes` output.
pub fn hash_to_hex_str(hash: &[u8; 32]) -> String {
    let mut rev = *hash;
    rev.reverse();
    hex::encode(rev)
}

pub struct ReorgDriver<'a, D, U, A, S> {
    pub daemon: &'a D,
    pub backup: BackupEngine<'a, U, A, S>,
    /// Signaled once a reorg's backups complete; a waiter clears/re-awaits
    /// it for the next reorg rather than holding a permanent subscription.
    pub backed_up_event: Arc<Notify>,
}

impl<'a, D, U, A, S> ReorgDriver<'a, D, U, A, S>
where
    D: DaemonRpc,
    U: UtxoStore,
    A: AssetStore,
    S: SuidStore,
{
    /// Drives one full reorg: flush, unconditional clear, locate the range,
    /// prefetch it in reverse, and back up each block after verifying it is
    /// still the current tip.
    #[allow(clippy::too_many_arguments)]
    pub async fn reorg_chain<H, T>(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        flush: &FlushCoordinator<'_, U, A, S, H, T>,
        header_store: &H,
        prefetcher: &Prefetcher<D>,
        blocks_dir: &Path,
        coin: &CoinParams,
        count: i64,
    ) -> Result<(), ChainError>
    where
        H: HeaderStore,
        T: StateStore,
    {
        // Flush unconditionally, always including UTXO+undo, so the undo
        // log for every block about to be backed up is durable.
        flush.flush(state, cache)?;

        // An interrupted or early-returning flush can leave residue that
        // violates the backup engine's flushed precondition; clear always.
        cache.clear_all();

        let (start, range_count) = self.calc_reorg_range(state, header_store, count).await?;
        // The blocks to back up are identified by our own stored header
        // hashes, not the daemon's — we're unwinding local history down to
        // the divergence point, verifying against `state.tip` as we go.
        let hex_hashes = self.local_hex_hashes(header_store, start, range_count)?;

        let pairs: Vec<(u32, String)> = (start..start + range_count)
            .zip(hex_hashes.iter().cloned())
            .collect();
        let mut reversed_pairs = pairs.clone();
        reversed_pairs.reverse();
        prefetcher.prefetch_many(&reversed_pairs).await;

        for (height, hex_hash) in reversed_pairs {
            if hex_hash != hash_to_hex_str(&state.tip) {
                return Err(ChainError::ReorgAncestorNotFound { height });
            }

            let path = blocks_dir.join(format!("{height}-{hex_hash}"));
            let block = OnDiskBlock::open(&path, coin)?;
            let txs_reversed = block.iter_txs_reversed()?;
            self.backup
                .backup_block(
                    state,
                    cache,
                    height,
                    &block.header,
                    block.raw_len(),
                    &txs_reversed,
                )
                .await?;
        }

        // Drop header-file/history-index records for the unwound range now
        // that every height in it has been undone.
        if let Err(e) = header_store.truncate_to(start.saturating_sub(1)) {
            tracing::error!(error = %e, "failed to truncate header store after reorg");
        }

        self.backed_up_event.notify_waiters();
        Ok(())
    }

    /// Mirrors the doubling binary probe: starting at `height-1` with a
    /// window of one block, compare local vs. daemon hex hashes, doubling
    /// the probe count each round bounded by the remaining distance to
    /// genesis, until a difference is found. A non-negative `count` instead
    /// names a simulated reorg depth directly.
    async fn calc_reorg_range<H: HeaderStore>(
        &self,
        state: &IndexerState,
        header_store: &H,
        count: i64,
    ) -> Result<(u32, u32), ChainError> {
        if count >= 0 {
            let depth = count as u32;
            let start = state.height.saturating_sub(depth).saturating_add(1);
            return Ok((start, depth.max(1)));
        }

        let height = state.height;
        let mut start = height.saturating_sub(1);
        let mut probe_count: u32 = 1;

        while start > 0 {
            let local_hex = self.local_hex_hashes(header_store, start, probe_count)?;
            let daemon_hex = self
                .daemon
                .block_hex_hashes(start, probe_count)
                .await
                .map_err(|_| ChainError::ReorgAncestorNotFound { height: start })?;

            let diverge_at = diff_pos(&local_hex, &daemon_hex);
            if diverge_at > 0 {
                start += diverge_at as u32;
                break;
            }

            probe_count = (probe_count * 2).min(start);
            start -= probe_count;
        }

        let range_count = (height - start) + 1;
        Ok((start, range_count))
    }

    fn local_hex_hashes<H: HeaderStore>(
        &self,
        header_store: &H,
        start: u32,
        count: u32,
    ) -> Result<Vec<String>, ChainError> {
        let mut out = Vec::with_capacity(count as usize);
        for height in start..start + count {
            let header = header_store
                .header_at(height)
                .ok()
                .flatten()
                .ok_or(ChainError::ReorgAncestorNotFound { height })?;
            out.push(hash_to_hex_str(&double_sha256(&header)));
        }
        Ok(out)
    }
}

/// Index of the first differing element, or the shorter list's length if
/// one is a prefix of the other.
fn diff_pos(a: &[String], b: &[String]) -> usize {
    a.iter().zip(b.iter()).position(|(x, y)| x != y).unwrap_or_else(|| a.len().min(b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_pos_finds_first_mismatch() {
        let a = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let b = vec!["a".to_string(), "x".to_string(), "c".to_string()];
        assert_eq!(diff_pos(&a, &b), 1);
    }

    #[test]
    fn diff_pos_matching_prefixes_returns_shorter_len() {
        let a = vec!["a".to_string(), "b".to_string()];
        let b = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(diff_pos(&a, &b), 2);
    }

    #[test]
    fn hash_to_hex_str_reverses_bytes() {
        let mut hash = [0u8; 32];
        hash[0] = 0xab;
        let hex = hash_to_hex_str(&hash);
        assert!(hex.ends_with("ab"));
    }

    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FakeErr;
    impl std::fmt::Display for FakeErr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error")
        }
    }
    impl std::error::Error for FakeErr {}

    struct FakeHeaderStore {
        headers: HashMap<u32, Vec<u8>>,
    }

    impl HeaderStore for FakeHeaderStore {
        type Error = FakeErr;
        fn append_header(&self, _height: u32, _header: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }
        fn header_at(&self, height: u32) -> Result<Option<Vec<u8>>, Self::Error> {
            Ok(self.headers.get(&height).cloned())
        }
        fn append_history(
            &self,
            _tx_hashes: &[[u8; 32]],
            _tx_hashxs: &[Vec<crate::state::HashX>],
        ) -> Result<(), Self::Error> {
            Ok(())
        }
        fn truncate_to(&self, _height: u32) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    /// Returns whatever hex list was pre-recorded for the exact `(first,
    /// count)` the binary probe is expected to ask for; a query outside that
    /// set is a test-design bug, not a fallback case.
    struct ScriptedDaemon {
        responses: Mutex<HashMap<(u32, u32), Vec<String>>>,
    }

    #[async_trait]
    impl DaemonRpc for ScriptedDaemon {
        type Error = FakeErr;
        async fn height(&self) -> Result<u32, Self::Error> {
            Ok(0)
        }
        async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, Self::Error> {
            self.responses
                .lock()
                .unwrap()
                .get(&(first, count))
                .cloned()
                .ok_or(FakeErr)
        }
        async fn get_block(&self, _hex_hash: &str, _dest_path: &Path) -> Result<u64, Self::Error> {
            Err(FakeErr)
        }
    }

    struct EmptyAssetStore;
    impl UtxoStore for EmptyAssetStore {
        type Error = FakeErr;
        fn get_utxo(&self, _key: &crate::state::UtxoKey) -> Result<Option<crate::state::UtxoValue>, Self::Error> {
            Ok(None)
        }
        fn put_utxo(&self, _key: &crate::state::UtxoKey, _value: &crate::state::UtxoValue) -> Result<(), Self::Error> {
            Ok(())
        }
        fn delete_utxo(&self, _key: &crate::state::UtxoKey) -> Result<(), Self::Error> {
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
    impl AssetStore for EmptyAssetStore {
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
    impl SuidStore for EmptyAssetStore {
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

    fn header_for(height: u32) -> Vec<u8> {
        vec![height as u8; 80]
    }

    // Local chain matches the daemon down through height 7; height 8 is
    // where the two chains diverge. The doubling probe starts at height 8
    // with a window of one (full mismatch), doubles to a window of two at
    // height 6 (full match), and locks onto height 8 as the exact
    // divergence point with two blocks (8 and 9) needing to be backed up.
    #[tokio::test]
    async fn calc_reorg_range_locates_divergence_one_block_past_last_match() {
        let mut local_headers = HashMap::new();
        for h in 1..=9u32 {
            local_headers.insert(h, header_for(h));
        }
        let header_store = FakeHeaderStore { headers: local_headers };

        let hash6 = hash_to_hex_str(&double_sha256(&header_for(6)));
        let hash7 = hash_to_hex_str(&double_sha256(&header_for(7)));

        let mut responses = HashMap::new();
        responses.insert((8u32, 1u32), vec!["divergent-hash-at-8".to_string()]);
        responses.insert((6u32, 2u32), vec![hash6, hash7]);
        let daemon = ScriptedDaemon {
            responses: Mutex::new(responses),
        };

        let store = EmptyAssetStore;
        let driver = ReorgDriver {
            daemon: &daemon,
            backup: BackupEngine {
                utxo_store: &store,
                asset_store: &store,
                suid_store: &store,
            },
            backed_up_event: Arc::new(Notify::new()),
        };

        let mut state = IndexerState::default();
        state.height = 9;

        let (start, count) = driver.calc_reorg_range(&state, &header_store, -1).await.unwrap();
        assert_eq!((start, count), (8, 2));
    }
}
