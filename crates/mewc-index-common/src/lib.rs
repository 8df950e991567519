// SPDX-License-Identifier: MIT OR Apache-2.0
#![cfg_attr(not(feature = "std"), no_std)]

//! Common types and constants for the mewc chain indexer core: sentinel
//! values, fixed-width layouts, and the error enums shared between the
//! codec, the advance/backup engines, and the store adapters.

pub mod consts;
pub mod error;
pub mod prelude;

pub use consts::*;
pub use error::ChainError;
pub use error::DeserializeError;
