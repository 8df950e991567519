//! General configuration for the indexer daemon.
//!
//! Mirrors `florestad::Config`: a plain struct with CLI-friendly field names,
//! optionally overridden by a toml config file, with the CLI struct taking
//! precedence over the file on conflicting scalars.

use std::net::SocketAddr;
use std::path::PathBuf;

use mewc_index_core::block::CoinParams;
use serde::Deserialize;

/// Which Meowcoin-derived network we're indexing. Only `Mainnet` has
/// concrete activation heights wired up; the others reuse mainnet's until a
/// real deployment needs otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn coin_params(self) -> CoinParams {
        match self {
            Network::Mainnet => CoinParams {
                static_header_len: 80,
                auxpow_activation_height: 1_219_736,
                kawpow_activation_height: 1_219_736,
                genesis_activation_height: 0,
                prefetch_limit: 8,
                avg_block_size: 256 * 1024,
            },
            Network::Testnet | Network::Regtest => CoinParams {
                static_header_len: 80,
                auxpow_activation_height: 0,
                kawpow_activation_height: 0,
                genesis_activation_height: 0,
                prefetch_limit: 8,
                avg_block_size: 64 * 1024,
            },
        }
    }
}

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "mewc-indexerd", version, about = "Block-processing daemon for a Meowcoin-style asset chain indexer")]
pub struct Cli {
    /// Where to place the data directory. Defaults to $HOME/.mewc-indexerd.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Toml config file to read, merged under the CLI flags.
    #[arg(long)]
    pub config_file: Option<PathBuf>,

    /// The network to index.
    #[arg(long, value_enum, default_value_t = Network::Mainnet)]
    pub network: Network,

    /// Host:port of the daemon's JSON-RPC interface.
    #[arg(long)]
    pub daemon_rpc: Option<SocketAddr>,

    /// Daemon RPC username.
    #[arg(long)]
    pub rpc_user: Option<String>,

    /// Daemon RPC password.
    #[arg(long)]
    pub rpc_password: Option<String>,

    /// Combined write-back cache budget in megabytes before a flush is
    /// forced.
    #[arg(long)]
    pub cache_mb: Option<f64>,

    /// Worker threads for block-processor tasks.
    #[arg(long)]
    pub bp_workers: Option<usize>,

    /// Worker threads for client-facing reads.
    #[arg(long)]
    pub client_workers: Option<usize>,

    /// Enable the `invalid_chain_vouts/` diagnostic dump of malformed
    /// scripts.
    #[arg(long)]
    pub write_bad_vouts_to_file: bool,

    /// Idle sleep, in seconds, between catch-up probes.
    #[arg(long)]
    pub polling_delay: Option<u64>,

    /// Write logs to stdout.
    #[arg(long, default_value_t = true)]
    pub log_to_stdout: bool,

    /// Write logs to `{data_dir}/output.log`.
    #[arg(long)]
    pub log_to_file: bool,

    /// Enable debug-level logging.
    #[arg(long)]
    pub debug: bool,
}

/// The subset of [`Cli`] a config file may also set. Every field is
/// optional: an absent key leaves the CLI's value (or its default) in
/// place.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub data_dir: Option<PathBuf>,
    pub daemon_rpc: Option<String>,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub cache_mb: Option<f64>,
    pub bp_workers: Option<usize>,
    pub client_workers: Option<usize>,
    pub write_bad_vouts_to_file: Option<bool>,
    pub polling_delay: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Fully resolved configuration: CLI flags merged over an optional config
/// file, with every default substituted.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub network: Network,
    pub daemon_rpc: SocketAddr,
    pub rpc_user: String,
    pub rpc_password: String,
    pub cache_mb: f64,
    pub bp_workers: usize,
    pub client_workers: usize,
    pub write_bad_vouts_to_file: bool,
    pub polling_delay_secs: u64,
    pub log_to_stdout: bool,
    pub log_to_file: bool,
    pub debug: bool,
}

impl Config {
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config_file {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };

        let data_dir = cli
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| data_dir_path(cli.network));

        let daemon_rpc = cli
            .daemon_rpc
            .or_else(|| file.daemon_rpc.as_deref().and_then(|s| s.parse().ok()))
            .unwrap_or_else(|| default_rpc_addr(cli.network));

        Ok(Config {
            data_dir,
            network: cli.network,
            daemon_rpc,
            rpc_user: cli.rpc_user.or(file.rpc_user).unwrap_or_default(),
            rpc_password: cli.rpc_password.or(file.rpc_password).unwrap_or_default(),
            cache_mb: cli.cache_mb.or(file.cache_mb).unwrap_or(1_200.0),
            bp_workers: cli.bp_workers.or(file.bp_workers).unwrap_or(2),
            client_workers: cli.client_workers.or(file.client_workers).unwrap_or(2),
            write_bad_vouts_to_file: cli.write_bad_vouts_to_file || file.write_bad_vouts_to_file.unwrap_or(false),
            polling_delay_secs: cli
                .polling_delay
                .or(file.polling_delay)
                .unwrap_or(mewc_index_common::consts::DEFAULT_POLLING_DELAY_SECS),
            log_to_stdout: cli.log_to_stdout,
            log_to_file: cli.log_to_file,
            debug: cli.debug,
        })
    }

    pub fn blocks_dir(&self) -> PathBuf {
        self.data_dir.join("meta").join("blocks")
    }

    pub fn invalid_vouts_dir(&self) -> PathBuf {
        self.data_dir.join("invalid_chain_vouts")
    }
}

fn data_dir_path(network: Network) -> PathBuf {
    let mut base = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mewc-indexerd");
    match network {
        Network::Mainnet => {}
        Network::Testnet => base.push("testnet"),
        Network::Regtest => base.push("regtest"),
    }
    base
}

fn default_rpc_addr(network: Network) -> SocketAddr {
    let port = match network {
        Network::Mainnet => 9766,
        Network::Testnet => 19766,
        Network::Regtest => 19777,
    };
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rpc_addr_varies_by_network() {
        assert_ne!(default_rpc_addr(Network::Mainnet), default_rpc_addr(Network::Testnet));
    }

    #[test]
    fn data_dir_path_appends_network_subdir() {
        let testnet = data_dir_path(Network::Testnet);
        assert!(testnet.ends_with("testnet"));
    }
}
