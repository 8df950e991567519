//! Block prefetcher: concurrently downloads a bounded window of
//! upcoming blocks to disk and garbage-collects stale files.

use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use spin::Mutex;
use tokio::sync::Semaphore;

use crate::block::BlockFileRegistry;
use crate::store::DaemonRpc;

/// Tracks in-flight download tasks so at most one download per `hex_hash`
/// is ever spawned. Explicitly owned by the caller (the main loop), not a
/// hidden global, per the design note against process-wide singletons.
pub struct Prefetcher<D: DaemonRpc> {
    daemon: Arc<D>,
    registry: Arc<BlockFileRegistry>,
    blocks_dir: PathBuf,
    in_flight: Mutex<HashSet<String>>,
    limit: Arc<Semaphore>,
}

impl<D: DaemonRpc + 'static> Prefetcher<D> {
    pub fn new(
        daemon: Arc<D>,
        registry: Arc<BlockFileRegistry>,
        blocks_dir: PathBuf,
        prefetch_limit: usize,
    ) -> Self {
        Prefetcher {
            daemon,
            registry,
            blocks_dir,
            in_flight: Mutex::new(HashSet::new()),
            limit: Arc::new(Semaphore::new(prefetch_limit.max(1))),
        }
    }

    /// Spawn a bounded set of concurrent downloads for `(height, hex_hash)`
    /// pairs not already on disk or in flight. Errors are logged and the
    /// task dropped; the main loop's next polling pass retries.
    pub async fn prefetch_many(&self, wanted: &[(u32, String)]) {
        let mut handles = Vec::new();

        for (height, hex_hash) in wanted {
            if self.registry.contains(hex_hash) {
                continue;
            }
            {
                let mut in_flight = self.in_flight.lock();
                if !in_flight.insert(hex_hash.clone()) {
                    continue;
                }
            }

            let daemon = self.daemon.clone();
            let registry = self.registry.clone();
            let dir = self.blocks_dir.clone();
            let limit = self.limit.clone();
            let height = *height;
            let hex_hash = hex_hash.clone();

            handles.push(tokio::spawn(async move {
                let _permit = limit.acquire().await.expect("semaphore not closed");
                download_one(&*daemon, &registry, &dir, height, &hex_hash).await;
            }));
        }

        for h in handles {
            let _ = h.await;
        }

        self.in_flight.lock().clear();
    }

    /// Delete prefetched files at or below `tip - lookback`.
    pub fn delete_stale(&self, tip: u32, lookback: u32) {
        crate::block::delete_stale(&self.registry, &self.blocks_dir, tip, lookback);
    }
}

async fn download_one<D: DaemonRpc>(
    daemon: &D,
    registry: &BlockFileRegistry,
    dir: &Path,
    height: u32,
    hex_hash: &str,
) {
    let final_path = dir.join(format!("{height}-{hex_hash}"));
    let tmp_path = dir.join(format!("{hex_hash}.tmp"));

    match daemon.get_block(hex_hash, &tmp_path).await {
        Ok(size) => {
            if let Err(e) = std::fs::rename(&tmp_path, &final_path) {
                tracing::warn!(hex_hash, error = %e, "failed to rename prefetched block into place");
                let _ = std::fs::remove_file(&tmp_path);
                return;
            }
            registry.insert(hex_hash.to_string(), height, size);
        }
        Err(e) => {
            tracing::warn!(hex_hash, height, error = %e, "block download failed, will retry next pass");
            let _ = std::fs::remove_file(&tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    struct FakeDaemon {
        calls: AtomicUsize,
    }

    #[derive(Debug)]
    struct FakeErr;
    impl std::fmt::Display for FakeErr {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fake error")
        }
    }
    impl std::error::Error for FakeErr {}

    #[async_trait]
    impl DaemonRpc for FakeDaemon {
        type Error = FakeErr;

        async fn height(&self) -> Result<u32, Self::Error> {
            Ok(0)
        }

        async fn block_hex_hashes(&self, _first: u32, _count: u32) -> Result<Vec<String>, Self::Error> {
            Ok(vec![])
        }

        async fn get_block(&self, _hex_hash: &str, dest_path: &Path) -> Result<u64, Self::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(dest_path, b"raw-block-bytes").unwrap();
            Ok(16)
        }
    }

    #[tokio::test]
    async fn downloads_each_wanted_hash_once() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(FakeDaemon {
            calls: AtomicUsize::new(0),
        });
        let registry = BlockFileRegistry::new();
        let prefetcher = Prefetcher::new(daemon.clone(), registry.clone(), dir.path().to_path_buf(), 4);

        prefetcher
            .prefetch_many(&[(1, "aa".into()), (2, "bb".into())])
            .await;

        assert_eq!(daemon.calls.load(Ordering::SeqCst), 2);
        assert!(registry.contains("aa"));
        assert!(registry.contains("bb"));
        assert!(dir.path().join("1-aa").exists());
    }

    #[tokio::test]
    async fn skips_hashes_already_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = Arc::new(FakeDaemon {
            calls: AtomicUsize::new(0),
        });
        let registry = BlockFileRegistry::new();
        registry.insert("aa".into(), 1, 16);
        let prefetcher = Prefetcher::new(daemon.clone(), registry, dir.path().to_path_buf(), 4);

        prefetcher.prefetch_many(&[(1, "aa".into())]).await;
        assert_eq!(daemon.calls.load(Ordering::SeqCst), 0);
    }
}
