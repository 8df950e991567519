//! Daemon entry point: parse config, set up logging, open the concrete
//! `redb`/file-backed stores, wire the core's `Orchestrator`, and run until
//! ctrl-c or a fatal error.

mod config;
mod daemon;
mod logging;
mod malformed;
mod notify;
mod store;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mewc_index_core::advance::AdvanceEngine;
use mewc_index_core::advance::NullMalformedScriptSink;
use mewc_index_core::block::BlockFileRegistry;
use mewc_index_core::cache::WriteBackCache;
use mewc_index_core::flush::FlushCoordinator;
use mewc_index_core::orchestrator::Orchestrator;
use mewc_index_core::orchestrator::OrchestratorConfig;
use mewc_index_core::orchestrator::ReorgFlag;
use mewc_index_core::prefetch::Prefetcher;
use mewc_index_core::reorg::ReorgDriver;

use crate::config::Cli;
use crate::config::Config;
use crate::daemon::RpcDaemon;
use crate::malformed::FileMalformedScriptSink;
use crate::notify::LoggingNotificationSink;
use crate::store::FileHeaderStore;
use crate::store::RedbAssetStore;
use crate::store::RedbStateStore;
use crate::store::RedbSuidStore;
use crate::store::RedbUtxoStore;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli)?;

    logging::setup_logger(&config.data_dir, config.log_to_file, config.log_to_stdout, config.debug)?;

    tracing::info!(
        network = ?config.network,
        data_dir = %config.data_dir.display(),
        "starting mewc-indexerd"
    );

    let worker_threads = (config.bp_workers + config.client_workers).max(1);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    let coin = config.network.coin_params();

    let utxo_store = RedbUtxoStore::open(&config.data_dir.join("utxo"))?;
    let asset_store = RedbAssetStore::open(&config.data_dir.join("asset"))?;
    let suid_store = RedbSuidStore::open(&config.data_dir.join("suid"))?;
    let header_store = FileHeaderStore::open(&config.data_dir.join("headers"))?;
    let state_store = RedbStateStore::open(&config.data_dir.join("state"))?;

    let daemon_host = format!("http://{}", config.daemon_rpc);
    let daemon = Arc::new(RpcDaemon::new(&daemon_host, &config.rpc_user, &config.rpc_password));

    let blocks_dir = config.blocks_dir();
    std::fs::create_dir_all(&blocks_dir)?;

    let registry = BlockFileRegistry::new();
    let prefetcher = Prefetcher::new(daemon.clone(), registry, blocks_dir.clone(), coin.prefetch_limit as usize);

    let mut state = state_store.get_state()?.unwrap_or_default();
    let mut cache = WriteBackCache::new();

    let malformed_sink: Box<dyn mewc_index_core::advance::MalformedScriptSink> = if config.write_bad_vouts_to_file {
        Box::new(FileMalformedScriptSink::open(&config.invalid_vouts_dir())?)
    } else {
        Box::new(NullMalformedScriptSink)
    };

    let advance = AdvanceEngine {
        coin: &coin,
        utxo_store: &utxo_store,
        asset_store: &asset_store,
        suid_store: &suid_store,
        malformed_sink: malformed_sink.as_ref(),
    };

    let flush = FlushCoordinator {
        utxo_store: &utxo_store,
        asset_store: &asset_store,
        suid_store: &suid_store,
        header_store: &header_store,
        state_store: &state_store,
    };

    let reorg = ReorgDriver {
        daemon: daemon.as_ref(),
        backup: mewc_index_core::BackupEngine {
            utxo_store: &utxo_store,
            asset_store: &asset_store,
            suid_store: &suid_store,
        },
        backed_up_event: Arc::new(tokio::sync::Notify::new()),
    };

    let notification_sink = LoggingNotificationSink;

    let orchestrator_config = OrchestratorConfig {
        polling_delay: Duration::from_secs(config.polling_delay_secs),
        fetch_limit: 64,
        min_undo_lookback: 128,
        cache_mb_budget: config.cache_mb,
    };

    let orchestrator = Orchestrator {
        coin: &coin,
        daemon: daemon.as_ref(),
        prefetcher: &prefetcher,
        blocks_dir,
        advance,
        flush,
        reorg,
        header_store: &header_store,
        notification_sink: &notification_sink,
        reorg_flag: ReorgFlag::new(),
        config: orchestrator_config,
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down");
        let _ = shutdown_tx.send(());
    });

    let ok = orchestrator.fetch_and_process_blocks(&mut state, &mut cache, shutdown_rx).await;
    if !ok {
        anyhow::bail!("main loop exited with a fatal error");
    }
    Ok(())
}
