//! Migration-specific error types.

use thiserror::Error;

use super::compat::SchemaVersion;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The version path is not supported.
    #[error("unsupported migration path: {from} -> {to}")]
    UnsupportedPath {
        /// Source schema version.
        from: SchemaVersion,
        /// Target schema version.
        to: SchemaVersion,
    },

    /// Required indexes are missing.
    #[error("schema drift: missing indexes {}", missing.join(", "))]
    SchemaDrift {
        /// Missing indexes as `table.index`.
        missing: Vec<String>,
    },

    /// Row-level integrity check failed.
    #[error("data corruption: {corrupted_cards} of {total_cards} cards corrupted")]
    DataCorruption {
        /// Number of corrupted cards.
        corrupted_cards: usize,
        /// Number of cards scanned.
        total_cards: usize,
    },

    /// The pre-migration backup could not be created.
    #[error("backup failed: {reason}")]
    BackupFailed {
        /// The reason the backup failed.
        reason: String,
    },

    /// A migration step failed.
    #[error("step {step} failed: {message}")]
    StepFailed {
        /// Name of the failed step.
        step: String,
        /// Error message.
        message: String,
    },

    /// No handler is registered for a step.
    #[error("no handler registered for step {step}")]
    UnknownStep {
        /// Name of the step.
        step: String,
    },

    /// Restoring a backup failed.
    #[error("restore of backup {backup_id} failed: {reason}")]
    RestoreFailed {
        /// The backup being restored.
        backup_id: String,
        /// The reason restore failed.
        reason: String,
    },

    /// Another migration holds the engine.
    #[error("migration already in progress")]
    MigrationInProgress,

    /// The version marker holds something other than a version number.
    #[error("invalid version marker value: {value:?}")]
    InvalidVersionMarker {
        /// The stored value.
        value: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),
}

impl MigrationError {
    /// Wrap any error as a failure of the named step.
    pub fn step_failed(step: impl Into<String>, err: impl std::fmt::Display) -> Self {
        MigrationError::StepFailed {
            step: step.into(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::UnsupportedPath { from: 5, to: 1 };
        assert_eq!(err.to_string(), "unsupported migration path: 5 -> 1");

        let err = MigrationError::SchemaDrift {
            missing: vec!["cards.fingerprint".into(), "versions.fingerprint".into()],
        };
        assert_eq!(
            err.to_string(),
            "schema drift: missing indexes cards.fingerprint, versions.fingerprint"
        );

        let err = MigrationError::step_failed("generate_missing_fingerprints", "boom");
        assert!(err.to_string().contains("generate_missing_fingerprints"));
    }

    #[test]
    fn test_storage_error_converts() {
        let err: MigrationError = crate::error::Error::TableMissing("migration_log".into()).into();
        assert!(matches!(err, MigrationError::Storage(_)));
    }
}
