//! Storage layer for Cardvault.
//!
//! A sled-backed card store plus the repository traits the migration
//! engine is written against.

mod config;
mod engine;
mod marker;
mod quota;
mod record;
mod repository;

pub mod key;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use marker::{FileVersionMarker, MemoryVersionMarker, VersionMarker};
pub use quota::{
    QuotaEstimator, SledQuotaEstimator, StaticQuotaEstimator, StorageEstimate, BYTES_PER_MB,
};
pub use record::{
    compute_checksum, is_valid_fingerprint, Card, StoredRow, VersionEntry, FINGERPRINT_MIN_DIGITS,
    FINGERPRINT_PREFIX,
};
pub use repository::{
    BackupRepository, MigrationLogRepository, RecordStore, BACKUPS_TABLE, CARDS_TABLE,
    MIGRATION_LOG_TABLE, MUTABLE_TABLES, VERSIONS_TABLE,
};
