//! Error types shared across the indexer core. No `thiserror`: errors are
//! hand-rolled enums with manual `Display`/`Error` impls, the same way
//! `floresta-chain` composes `BlockValidationErrors` into `BlockchainError`.

use core::fmt;

use crate::prelude::String;

/// Errors produced while decoding wire-format bytes (varints, transactions,
/// headers). Recoverable by the chunked reader at the on-disk block handle
/// level; fatal once a whole block has been read and still doesn't parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeserializeError {
    /// Fewer bytes remain than the field being read needs.
    Truncated { needed: usize, remaining: usize },
    /// A varint's length prefix claims more bytes than remain in the buffer.
    MalformedVarint,
    /// A full block was read and transactions still don't parse.
    MalformedBlock,
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeserializeError::Truncated { needed, remaining } => write!(
                f,
                "truncated input: needed {needed} bytes, {remaining} remaining"
            ),
            DeserializeError::MalformedVarint => write!(f, "malformed varint"),
            DeserializeError::MalformedBlock => write!(f, "malformed block: short read past chunking"),
        }
    }
}

impl std::error::Error for DeserializeError {}

/// Fatal errors from the advance/backup engines. Anything in this enum means
/// the calling block task must not flush: the `ok` flag stays false and the
/// process exits without persisting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Reissuing an asset whose prior metadata has `reissuable = false`.
    NonReissuable { asset: String },
    /// A UTXO referenced by an input could not be found in cache or store.
    UtxoNotFound { tx_hash: [u8; 32], vout: u32 },
    /// Undo info for a height was unreadable after the retry budget.
    NoUndoInfo { height: u32 },
    /// The UTXO-undo pointer didn't reach zero after replaying all inputs.
    UndoLengthMismatch { height: u32, remaining: usize },
    /// The asset or h160 id counter would overflow `u32`.
    IdCounterOverflow,
    /// A block's `prevhash` didn't match the reorg ancestor being sought.
    ReorgAncestorNotFound { height: u32 },
    /// A full block failed to deserialize even across chunk retries.
    Deserialize(DeserializeError),
    /// The ids being undone at a height weren't the contiguous top of the
    /// asset/h160 id counter, meaning interning order was corrupted.
    NonContiguousIdUndo { height: u32, counter: u32, ids: usize },
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::NonReissuable { asset } => {
                write!(f, "asset {asset} is not reissuable")
            }
            ChainError::UtxoNotFound { tx_hash, vout } => {
                write!(f, "utxo not found: {}:{vout}", hex::encode(tx_hash))
            }
            ChainError::NoUndoInfo { height } => {
                write!(f, "no undo info for height {height}")
            }
            ChainError::UndoLengthMismatch { height, remaining } => write!(
                f,
                "undo length mismatch at height {height}: {remaining} entries left unconsumed"
            ),
            ChainError::IdCounterOverflow => write!(f, "id counter overflow"),
            ChainError::ReorgAncestorNotFound { height } => {
                write!(f, "reorg ancestor not found at height {height}")
            }
            ChainError::Deserialize(e) => write!(f, "{e}"),
            ChainError::NonContiguousIdUndo { height, counter, ids } => write!(
                f,
                "non-contiguous id undo at height {height}: counter={counter}, {ids} ids to remove"
            ),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<DeserializeError> for ChainError {
    fn from(e: DeserializeError) -> Self {
        ChainError::Deserialize(e)
    }
}
