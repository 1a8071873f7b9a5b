//! Cardvault Core - card storage and the schema migration engine.
//!
//! This crate provides a sled-backed card store and the engine that
//! validates, backs up, executes, and rolls back schema migrations.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod error;
pub mod migration;
pub mod storage;

pub use config::{EngineConfig, DEFAULT_VERSION_MARKER_KEY};
pub use error::Error;
pub use migration::{
    Backup, BackupManager, Collaborators, ContentFingerprinter, Degradation, IntegrityReport,
    IntegrityValidator, MigrationError, MigrationExecutor, MigrationLog, MigrationLogStatus,
    MigrationLogger, MigrationOutcome, SchemaVersion, ValidationResult,
    VersionCompatibilityChecker,
};
pub use storage::{
    Card, FileVersionMarker, MemoryVersionMarker, StorageConfig, StorageEngine, VersionEntry,
    VersionMarker,
};
