//! Error types for PulseDB

use crate::types::ValueType;
use thiserror::Error;

/// Result type alias for PulseDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// PulseDB error types
#[derive(Error, Debug)]
pub enum Error {
    /// put/get called before any successful set_storage_path
    #[error("storage path not set")]
    StoragePathNotSet,

    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Access outside the mapped region
    #[error("range [{offset}, {offset}+{len}) exceeds mapped region of {size} bytes")]
    OutOfRange { offset: u64, len: usize, size: usize },

    /// Operation on a closed mapped file
    #[error("file already closed")]
    FileClosed,

    /// Counter id absent from the counter registry
    #[error("unknown counter id: {0}")]
    UnknownCounter(u16),

    /// Sample value not convertible to the counter's declared type
    #[error("type mismatch for counter {counter_id}: expected {expected}")]
    TypeMismatch { counter_id: u16, expected: ValueType },

    /// Serialized record wider than a block can hold
    #[error("record of {len} bytes exceeds block capacity of {capacity} bytes")]
    RecordTooLarge { len: usize, capacity: usize },

    /// Malformed block payload or header
    #[error("decode error: {0}")]
    Decode(String),

    /// Unparseable index file (treated as empty by callers)
    #[error("bad index: {0}")]
    BadIndex(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Client-side wait for a query response exceeded
    #[error("timeout waiting for response to query {query_id}")]
    Timeout { query_id: u64 },

    /// Channel to the engine closed
    #[error("engine channel closed")]
    ChannelClosed,
}

impl Error {
    /// Check if the error only affects a single sample or block
    /// (the engine logs these and continues).
    pub fn is_data_plane(&self) -> bool {
        matches!(
            self,
            Error::UnknownCounter(_)
                | Error::TypeMismatch { .. }
                | Error::RecordTooLarge { .. }
                | Error::Decode(_)
                | Error::BadIndex(_)
        )
    }
}
