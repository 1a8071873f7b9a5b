//! Migration engine for Cardvault.
//!
//! Moves the card store from one schema version to a higher one, or leaves
//! it exactly as it was:
//! - Table-driven version compatibility and step planning
//! - Pre-migration validation (path, indexes, integrity, storage headroom)
//! - A checksummed backup before any mutation
//! - Fail-fast step execution through a named handler registry
//! - An integrity commit gate, with restore-from-backup on failure
//! - A best-effort audit log
//!
//! # Example
//!
//! ```ignore
//! use cardvault_core::migration::{Collaborators, MigrationExecutor};
//!
//! let executor = MigrationExecutor::new(
//!     Collaborators::from_engine(engine, marker),
//!     EngineConfig::default(),
//! );
//!
//! let validation = executor.validate_migration(2, 3).await;
//! if validation.is_valid {
//!     let outcome = executor.perform_safe_migration(3).await;
//!     println!("{:?}", outcome);
//! }
//! ```

pub mod backfill;
pub mod backup;
pub mod compat;
pub mod error;
pub mod executor;
pub mod integrity;
pub mod logger;
pub mod report;
pub mod state;
pub mod steps;

pub use backfill::{BackfillConfig, BackfillReport, ContentFingerprinter, FingerprintBackfiller};
pub use backup::{Backup, BackupManager};
pub use compat::{
    IndexMap, MigrationStep, SchemaVersion, VersionCompatibilityChecker, ADD_FINGERPRINT_INDEXES,
    ADD_VERSION_HISTORY_INDEXES, CREATE_MIGRATION_LOG_TABLE, DEFAULT_SUPPORTED_VERSIONS,
    GENERATE_MISSING_FINGERPRINTS,
};
pub use error::MigrationError;
pub use executor::{
    Collaborators, MigrationExecutor, MigrationOutcome, PHASE_COMMIT_VERSION, PHASE_CREATE_BACKUP,
    PHASE_INTEGRITY_CHECK, PHASE_RESTORE_BACKUP,
};
pub use integrity::{IntegrityValidator, DEFAULT_REQUIRED_FREE_MB};
pub use logger::MigrationLogger;
pub use report::{
    Degradation, IndexValidationResult, IntegrityIssue, IntegrityReport, IssueKind,
    StorageSpaceReport, ValidationResult,
};
pub use state::{MigrationLog, MigrationLogStatus, StepError};
pub use steps::{GenerateFingerprintsStep, IndexStep, StepContext, StepHandler, StepRegistry, StepReport};
