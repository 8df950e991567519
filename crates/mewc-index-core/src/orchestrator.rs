//! Main loop (`fetch_and_process_blocks`): the starting → syncing →
//! caught_up state machine, with transient `reorging`, driving the advance
//! engine, flush coordinator, and reorg driver from one cooperative task.

use std::path::PathBuf;
use std::time::Duration;

use spin::Mutex;

use mewc_index_common::consts::PROCESS_WINDOW_DENOMINATOR;
use mewc_index_common::consts::PROCESS_WINDOW_NUMERATOR;
use mewc_index_common::ChainError;

use crate::advance::AdvanceEngine;
use crate::advance::MalformedScriptSink;
use crate::block::CoinParams;
use crate::block::OnDiskBlock;
use crate::cache::WriteBackCache;
use crate::flush;
use crate::flush::FlushCoordinator;
use crate::prefetch::Prefetcher;
use crate::reorg::ReorgDriver;
use crate::state::IndexerState;
use crate::store::AssetStore;
use crate::store::DaemonRpc;
use crate::store::HeaderStore;
use crate::store::NotificationSink;
use crate::store::StateStore;
use crate::store::SuidStore;
use crate::store::UtxoStore;

/// Sync state the main loop reports. `Reorging` is transient: it is entered
/// and left within one outer-loop iteration, never observed at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Starting,
    Syncing,
    CaughtUp,
    Reorging,
}

/// Shared reorg signal set by the advance path and consumed by the outer
/// loop: `None` means nothing pending; `Some(n) < 0` is a real reorg (the
/// driver binary-probes the divergence); `Some(n) >= 0` simulates backing up
/// exactly `n` blocks.
#[derive(Default)]
pub struct ReorgFlag(Mutex<Option<i64>>);

impl ReorgFlag {
    pub fn new() -> Self {
        ReorgFlag(Mutex::new(None))
    }

    pub fn set(&self, count: i64) {
        *self.0.lock() = Some(count);
    }

    pub fn take(&self) -> Option<i64> {
        self.0.lock().take()
    }
}

pub struct OrchestratorConfig {
    pub polling_delay: Duration,
    pub fetch_limit: u32,
    pub min_undo_lookback: u32,
    pub cache_mb_budget: f64,
}

pub struct Orchestrator<'a, D, U, A, S, M, H, T, N> {
    pub coin: &'a CoinParams,
    pub daemon: &'a D,
    pub prefetcher: &'a Prefetcher<D>,
    pub blocks_dir: PathBuf,
    pub advance: AdvanceEngine<'a, U, A, S, M>,
    pub flush: FlushCoordinator<'a, U, A, S, H, T>,
    pub reorg: ReorgDriver<'a, D, U, A, S>,
    pub header_store: &'a H,
    pub notification_sink: &'a N,
    pub reorg_flag: ReorgFlag,
    pub config: OrchestratorConfig,
}

impl<'a, D, U, A, S, M, H, T, N> Orchestrator<'a, D, U, A, S, M, H, T, N>
where
    D: DaemonRpc + 'static,
    U: UtxoStore,
    A: AssetStore,
    S: SuidStore,
    M: MalformedScriptSink,
    H: HeaderStore,
    T: StateStore,
    N: NotificationSink,
{
    /// Runs until `shutdown` fires or a fatal `ChainError` is hit. Returns
    /// `true` if the loop exited cleanly (no in-flight partial mutation),
    /// the precondition for the caller's final flush.
    pub async fn fetch_and_process_blocks(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> bool {
        let mut sync_state = SyncState::Starting;
        let mut ok = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested, stopping main loop");
                    break;
                }
                outcome = self.run_one_iteration(state, cache, sync_state) => {
                    match outcome {
                        Ok(next) => sync_state = next,
                        Err(e) => {
                            tracing::error!(error = %e, "fatal error in main loop, exiting without flush");
                            ok = false;
                            break;
                        }
                    }
                }
            }

            if let Some(count) = self.reorg_flag.take() {
                let resumed_state = sync_state;
                sync_state = SyncState::Reorging;
                let reorg_result = self
                    .reorg
                    .reorg_chain(
                        state,
                        cache,
                        &self.flush,
                        self.header_store,
                        self.prefetcher,
                        &self.blocks_dir,
                        self.coin,
                        count,
                    )
                    .await;
                if let Err(e) = reorg_result {
                    tracing::error!(error = %e, "reorg driver failed");
                    ok = false;
                    break;
                }
                sync_state = resumed_state;
            }
        }

        if ok {
            // Work under the (conceptual) state lock is shielded from
            // cancellation; by the time we reach here the select loop has
            // already returned, so no concurrent mutation is in flight.
            if let Err(e) = self.flush.flush(state, cache) {
                tracing::error!(error = %e, "final flush on graceful shutdown failed");
            }
        }

        ok
    }

    async fn run_one_iteration(
        &self,
        state: &mut IndexerState,
        cache: &mut WriteBackCache,
        sync_state: SyncState,
    ) -> Result<SyncState, ChainError> {
        let daemon_height = match self.daemon.height().await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "daemon height request failed, retrying");
                tokio::time::sleep(self.config.polling_delay).await;
                return Ok(sync_state);
            }
        };

        let first = state.height + 1;
        let hex_hashes = match self.daemon.block_hex_hashes(first, self.config.fetch_limit).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "block hash window request failed, retrying");
                tokio::time::sleep(self.config.polling_delay).await;
                return Ok(sync_state);
            }
        };

        if hex_hashes.is_empty() {
            tokio::time::sleep(self.config.polling_delay).await;
            return Ok(SyncState::CaughtUp);
        }

        let window: Vec<(u32, String)> = (first..).zip(hex_hashes.iter().cloned()).collect();
        self.prefetcher.prefetch_many(&window).await;

        // Process only a fraction of the prefetched window per pass, so
        // prefetch-ahead stays smoothed against processing lag.
        let n = window.len() as u32;
        let process_count =
            ((n * PROCESS_WINDOW_NUMERATOR) + PROCESS_WINDOW_DENOMINATOR - 1) / PROCESS_WINDOW_DENOMINATOR;
        let to_process = &window[..process_count as usize];

        // Undo records only need to survive as far back as a reorg could
        // plausibly reach from the daemon's current tip, not ours.
        let min_undo_height = daemon_height.saturating_sub(self.config.min_undo_lookback);
        let mut reorg_detected = false;

        for (height, hex_hash) in to_process {
            let path = self.blocks_dir.join(format!("{height}-{hex_hash}"));
            let block = match OnDiskBlock::open(&path, self.coin) {
                Ok(b) => b,
                Err(_) => {
                    // Not downloaded yet; retry this height next pass.
                    break;
                }
            };
            let txs = block.iter_txs()?;
            let block_prevhash = extract_prevhash(&block.header);

            let outcome = self.advance.advance_block(
                state,
                cache,
                *height,
                block_prevhash,
                &block.header,
                block.raw_len(),
                &txs,
                min_undo_height,
            )?;

            if outcome.reorg_detected {
                reorg_detected = true;
                break;
            }
        }

        if reorg_detected {
            // Flush before the reorg proceeds; undo flushing is
            // unconditional on this path since the reorg driver itself
            // flushes again before backing up.
            self.flush.flush(state, cache)?;
            self.reorg_flag.set(-1);
            return Ok(SyncState::Syncing);
        }

        let caught_up = (state.height + 1) >= daemon_height;
        if caught_up && !cache.touched.is_empty() {
            self.notification_sink.notify(&cache.touched).await;
            cache.touched.clear();
        }

        let lag = daemon_height.saturating_sub(state.height);
        let decision = flush::decide(cache, self.config.cache_mb_budget, caught_up, lag);
        if decision.should_flush {
            self.flush.flush(state, cache)?;
        }

        if caught_up {
            Ok(SyncState::CaughtUp)
        } else {
            Ok(SyncState::Syncing)
        }
    }
}

/// A header's `prevhash` field occupies bytes 4..36 (after the 4-byte
/// version), the same layout the advance engine and backup engine both read.
fn extract_prevhash(header: &[u8]) -> [u8; 32] {
    header
        .get(4..36)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0u8; 32])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_flag_round_trips() {
        let flag = ReorgFlag::new();
        assert_eq!(flag.take(), None);
        flag.set(-1);
        assert_eq!(flag.take(), Some(-1));
        assert_eq!(flag.take(), None);
    }

    #[test]
    fn extract_prevhash_reads_bytes_4_to_36() {
        let mut header = vec![0u8; 80];
        header[4] = 0xaa;
        header[35] = 0xbb;
        let prevhash = extract_prevhash(&header);
        assert_eq!(prevhash[0], 0xaa);
        assert_eq!(prevhash[31], 0xbb);
    }

    #[test]
    fn extract_prevhash_defaults_on_short_header() {
        let header = vec![0u8; 10];
        assert_eq!(extract_prevhash(&header), [0u8; 32]);
    }
}
