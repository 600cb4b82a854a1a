//! Wire Protocol Module
//!
//! Binary encoding shared by clients, gateways and workers.
//!
//! ## Layers
//! - **`codec`**: variable-schema records (raw dataset lines, books, reviews,
//!   query results) with a presence bitmask and length-prefixed strings.
//! - **`batch`**: the envelope carrying `client_id`, sender identity and
//!   sequence number. It is the unit of acknowledgement and deduplication;
//!   an empty batch is the EOF marker.
//! - **`cursor`**: the byte reader every decode path goes through.

pub mod batch;
pub mod codec;
pub mod cursor;
pub mod types;

pub use batch::Batch;
pub use types::{Dataset, Field, Message, MessageKind, Record, SenderId, query_result_fields};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("field {field} is {len} bytes, longer than its length prefix allows")]
    FieldTooLong { field: String, len: usize },

    #[error("message kind {0:?} has no wire tag")]
    UnknownKind(MessageKind),

    #[error("batch holds {0} records, at most 255 fit")]
    TooManyMessages(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// True when the peer went away rather than sent garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            CodecError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests;
