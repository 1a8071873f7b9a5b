//! Core error types.

use thiserror::Error;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying sled error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// JSON encoding or decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error (version marker, imports).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The named table has not been created yet.
    #[error("table not found: {0}")]
    TableMissing(String),

    /// The named table is not known to the store.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// Record not found.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether this error only means the target table does not exist yet.
    pub fn is_table_missing(&self) -> bool {
        matches!(self, Error::TableMissing(_))
    }
}
