//! JSON-RPC client for the trusted node daemon, speaking the same
//! bitcoind-style RPC the node exposes: `getblockcount`, `getblockhash`,
//! `getblock` (verbose=0, raw hex). Mirrors `floresta-cli`'s use of the
//! `jsonrpc` crate's `minreq_http` transport, just against three read-only
//! calls instead of a full wallet/node control surface.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use jsonrpc::serde_json::value::to_raw_value;
use jsonrpc::serde_json::Value;
use jsonrpc::Client;
use mewc_index_core::store::DaemonRpc;
use serde::Deserialize;

#[derive(Debug)]
pub enum DaemonError {
    Transport(jsonrpc::Error),
    Io(std::io::Error),
    Decode(hex::FromHexError),
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Transport(e) => write!(f, "daemon rpc transport error: {e}"),
            DaemonError::Io(e) => write!(f, "writing prefetched block to disk: {e}"),
            DaemonError::Decode(e) => write!(f, "decoding hex block payload: {e}"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<jsonrpc::Error> for DaemonError {
    fn from(e: jsonrpc::Error) -> Self {
        DaemonError::Transport(e)
    }
}

fn call<T: for<'de> Deserialize<'de>>(client: &Client, method: &str, params: &[Value]) -> Result<T, DaemonError> {
    let raw_args: Vec<Box<jsonrpc::serde_json::value::RawValue>> = params
        .iter()
        .map(|v| to_raw_value(v).expect("infallible: serializing our own params"))
        .collect();
    let request = client.build_request(method, &raw_args);
    let response = client.send_request(request)?;
    response.result::<T>().map_err(DaemonError::from)
}

/// A thin `jsonrpc::Client` wrapped for use from async call sites: every
/// method runs the blocking round trip inside `spawn_blocking`, since the
/// `minreq_http` transport has no async variant. The client is reference
/// counted so a call can move its own handle across the `spawn_blocking`
/// boundary without the daemon itself needing to be `'static`.
pub struct RpcDaemon {
    client: Arc<Client>,
}

impl RpcDaemon {
    pub fn new(host: &str, user: &str, password: &str) -> Self {
        let pass = if password.is_empty() { None } else { Some(password.to_string()) };
        let client = Client::minreq_http(host, Some(user.to_string()), pass)
            .expect("constructing the jsonrpc transport is infallible for a well-formed host string");
        RpcDaemon { client: Arc::new(client) }
    }
}

#[async_trait]
impl DaemonRpc for RpcDaemon {
    type Error = DaemonError;

    async fn height(&self) -> Result<u32, Self::Error> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || call::<u64>(&client, "getblockcount", &[]))
            .await
            .expect("blocking daemon call panicked")
            .map(|h| h as u32)
    }

    async fn block_hex_hashes(&self, first: u32, count: u32) -> Result<Vec<String>, Self::Error> {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let mut hashes = Vec::with_capacity(count as usize);
            for height in first..first + count {
                match call::<String>(&client, "getblockhash", &[Value::from(height)]) {
                    Ok(hash) => hashes.push(hash),
                    // Past the daemon's tip: stop, don't error the whole window.
                    Err(_) => break,
                }
            }
            Ok(hashes)
        })
        .await
        .expect("blocking daemon call panicked")
    }

    async fn get_block(&self, hex_hash: &str, dest_path: &Path) -> Result<u64, Self::Error> {
        let client = self.client.clone();
        let hex_hash = hex_hash.to_string();
        let dest_path = dest_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let raw_hex: String = call(&client, "getblock", &[Value::from(hex_hash), Value::from(0)])?;
            let bytes = hex::decode(raw_hex.trim()).map_err(DaemonError::Decode)?;

            let tmp_path = dest_path.with_extension("part");
            std::fs::write(&tmp_path, &bytes).map_err(DaemonError::Io)?;
            std::fs::rename(&tmp_path, &dest_path).map_err(DaemonError::Io)?;
            Ok(bytes.len() as u64)
        })
        .await
        .expect("blocking daemon call panicked")
    }
}
