//! Persistence Module
//!
//! Everything a stateful process needs to survive a crash.
//!
//! ## Core Concepts
//! - **Fixed records** (`kv`): key-value file with fixed-width typed columns, so
//!   every upsert of an existing key is one in-place seeked write.
//! - **Write-ahead log** (`wal`): backward-readable entries marking how far a
//!   metadata change got before a crash.
//! - **Metadata** (`metadata`): the two combined under a log-before-mutate
//!   protocol, with undo on restart.
//! - **Snapshots** (`snapshot`): generation-stamped worker contexts whose live
//!   generation is itself a metadata key.

pub mod kv;
pub mod metadata;
pub mod snapshot;
pub mod types;
pub mod wal;

use crate::fault::InjectedFailure;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid file: {0}")]
    InvalidFile(String),

    #[error("{count} values given, capacity is {capacity}")]
    TooManyValues { count: usize, capacity: usize },

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("value of {len} bytes does not fit a {width} byte column")]
    ValueTooLong { len: usize, width: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Injected(#[from] InjectedFailure),
}
