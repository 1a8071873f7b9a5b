//! CLI error types.

use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] cardvault_core::Error),

    /// Migration error.
    #[error("{0}")]
    Migration(#[from] cardvault_core::MigrationError),

    /// JSON error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Input file is not in a supported shape.
    #[error("invalid import: {0}")]
    InvalidImport(String),

    /// The requested migration did not commit.
    #[error("migration failed: {0}")]
    MigrationFailed(String),
}
