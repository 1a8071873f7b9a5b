//! Migration executor - orchestrates the safe migration workflow.
//!
//! Validate, open a log entry, back up, run steps, gate on integrity, then
//! either commit the version marker or restore the backup.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::backfill::{ContentFingerprinter, FingerprintBackfiller};
use super::backup::{Backup, BackupManager};
use super::compat::{SchemaVersion, VersionCompatibilityChecker};
use super::error::MigrationError;
use super::integrity::IntegrityValidator;
use super::logger::MigrationLogger;
use super::report::{Degradation, ValidationResult};
use super::state::MigrationLog;
use super::steps::{StepContext, StepRegistry};
use crate::config::EngineConfig;
use crate::storage::key::generate_id;
use crate::storage::{
    BackupRepository, MigrationLogRepository, QuotaEstimator, RecordStore, StorageEngine,
    VersionMarker,
};

/// Log step name for backup failures.
pub const PHASE_CREATE_BACKUP: &str = "create_backup";

/// Log step name for commit gate failures.
pub const PHASE_INTEGRITY_CHECK: &str = "integrity_check";

/// Log step name for version marker failures.
pub const PHASE_COMMIT_VERSION: &str = "commit_version";

/// Log step name for restore failures.
pub const PHASE_RESTORE_BACKUP: &str = "restore_backup";

/// Everything the executor talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Live record tables.
    pub records: Arc<dyn RecordStore>,
    /// Backup storage.
    pub backups: Arc<dyn BackupRepository>,
    /// Migration log storage.
    pub logs: Arc<dyn MigrationLogRepository>,
    /// Process-wide version marker.
    pub marker: Arc<dyn VersionMarker>,
    /// Host quota introspection.
    pub quota: Arc<dyn QuotaEstimator>,
    /// Optional fingerprint backfill.
    pub backfiller: Option<Arc<dyn FingerprintBackfiller>>,
}

impl Collaborators {
    /// Wire every collaborator to one storage engine.
    pub fn from_engine(engine: Arc<StorageEngine>, marker: Arc<dyn VersionMarker>) -> Self {
        Self {
            records: engine.clone(),
            backups: engine.clone(),
            logs: engine.clone(),
            marker,
            quota: Arc::new(engine.quota_estimator()),
            backfiller: Some(Arc::new(ContentFingerprinter::new(engine))),
        }
    }

    /// Replace the fingerprint backfiller.
    pub fn with_backfiller(mut self, backfiller: Arc<dyn FingerprintBackfiller>) -> Self {
        self.backfiller = Some(backfiller);
        self
    }

    /// Run without a fingerprint backfiller.
    pub fn without_backfiller(mut self) -> Self {
        self.backfiller = None;
        self
    }
}

/// Outcome of [`MigrationExecutor::perform_safe_migration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// The new version was committed.
    Completed {
        /// Migration id.
        migration_id: String,
        /// Source version.
        from_version: SchemaVersion,
        /// Committed version.
        to_version: SchemaVersion,
        /// Cards processed by counting steps.
        processed_cards: u64,
        /// Wall-clock duration in milliseconds.
        duration_ms: u64,
        /// Capabilities that were skipped.
        degraded: Vec<Degradation>,
    },
    /// The migration did not commit.
    Failed {
        /// Migration id, if a log entry was opened.
        migration_id: Option<String>,
        /// What went wrong.
        error: String,
        /// Whether live tables were restored from the backup.
        rollback_completed: bool,
    },
}

impl MigrationOutcome {
    /// Whether the migration committed.
    pub fn is_success(&self) -> bool {
        matches!(self, MigrationOutcome::Completed { .. })
    }

    fn rejected(error: impl std::fmt::Display) -> Self {
        MigrationOutcome::Failed {
            migration_id: None,
            error: error.to_string(),
            rollback_completed: false,
        }
    }
}

/// Orchestrates validated, backed-up, reversible migrations.
pub struct MigrationExecutor {
    records: Arc<dyn RecordStore>,
    marker: Arc<dyn VersionMarker>,
    backfiller: Option<Arc<dyn FingerprintBackfiller>>,
    checker: VersionCompatibilityChecker,
    validator: IntegrityValidator,
    backups: BackupManager,
    logger: MigrationLogger,
    registry: StepRegistry,
    config: EngineConfig,
    in_flight: Mutex<()>,
}

impl MigrationExecutor {
    /// Create an executor with the built-in steps.
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self::with_registry(collaborators, config, StepRegistry::with_builtin())
    }

    /// Create an executor with a custom step registry.
    pub fn with_registry(
        collaborators: Collaborators,
        config: EngineConfig,
        registry: StepRegistry,
    ) -> Self {
        let checker = VersionCompatibilityChecker::new(config.supported_versions.iter().copied());
        let validator = IntegrityValidator::new(
            collaborators.records.clone(),
            collaborators.quota.clone(),
            checker.clone(),
        )
        .with_required_free_mb(config.required_free_mb);

        Self {
            backups: BackupManager::new(collaborators.records.clone(), collaborators.backups),
            logger: MigrationLogger::new(collaborators.logs),
            records: collaborators.records,
            marker: collaborators.marker,
            backfiller: collaborators.backfiller,
            checker,
            validator,
            registry,
            config,
            in_flight: Mutex::new(()),
        }
    }

    /// The version checker.
    pub fn checker(&self) -> &VersionCompatibilityChecker {
        &self.checker
    }

    /// The integrity validator.
    pub fn validator(&self) -> &IntegrityValidator {
        &self.validator
    }

    /// The backup manager.
    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// The migration logger.
    pub fn logger(&self) -> &MigrationLogger {
        &self.logger
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current schema version from the marker, or the configured initial version.
    pub async fn current_version(&self) -> Result<SchemaVersion, MigrationError> {
        match self.marker.get(&self.config.version_marker_key).await? {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| MigrationError::InvalidVersionMarker { value }),
            None => Ok(self.config.initial_version),
        }
    }

    /// Bring an unmarked store up to the initial version's schema.
    ///
    /// Creates the tables and indexes the initial version requires and
    /// writes the version marker. A store that already has a marker is left
    /// alone. Returns the current version.
    pub async fn initialize(&self) -> Result<SchemaVersion, MigrationError> {
        if self.marker.get(&self.config.version_marker_key).await?.is_some() {
            return self.current_version().await;
        }

        let version = self.config.initial_version;
        for (table, indexes) in self.checker.required_indexes(version) {
            self.records.create_table(&table).await?;
            for index in &indexes {
                self.records.create_index(&table, index).await?;
            }
        }
        self.marker
            .set(&self.config.version_marker_key, &version.to_string())
            .await?;

        tracing::info!(version, "store initialized");
        Ok(version)
    }

    /// Pre-migration validation of `from -> to`.
    pub async fn validate_migration(&self, from: SchemaVersion, to: SchemaVersion) -> ValidationResult {
        self.validator.validate_migration(from, to).await
    }

    /// Every migration log entry, oldest first.
    pub async fn history(&self) -> Result<Vec<MigrationLog>, MigrationError> {
        self.logger.history().await
    }

    /// Migrate from the current version to `target`.
    ///
    /// Never returns an error: every failure is reported in the outcome.
    pub async fn perform_safe_migration(&self, target: SchemaVersion) -> MigrationOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::warn!(target_version = target, "migration rejected, another is in flight");
            return MigrationOutcome::rejected(MigrationError::MigrationInProgress);
        };

        let from = match self.current_version().await {
            Ok(version) => version,
            Err(e) => return MigrationOutcome::rejected(e),
        };

        let validation = self.validator.validate_migration(from, target).await;
        if !validation.is_valid {
            tracing::warn!(
                from_version = from,
                to_version = target,
                errors = ?validation.errors,
                "migration validation failed"
            );
            return MigrationOutcome::rejected(validation.errors.join("; "));
        }
        for warning in &validation.warnings {
            tracing::warn!(from_version = from, to_version = target, warning = %warning, "validation warning");
        }

        let affected_cards = match self.records.list_cards().await {
            Ok(cards) => cards.len() as u64,
            Err(e) => return MigrationOutcome::rejected(MigrationError::from(e)),
        };

        let started = Instant::now();
        let mut log = MigrationLog::new(generate_id("migration"), from, target);
        log.affected_cards = affected_cards;
        self.logger.append(&log).await;

        tracing::info!(
            migration_id = %log.id,
            from_version = from,
            to_version = target,
            affected_cards,
            "migration started"
        );

        let backup = match self.backups.create_backup(from).await {
            Ok(backup) => backup,
            Err(e) => {
                tracing::error!(migration_id = %log.id, error = %e, "backup failed, migration aborted");
                log.record_error(PHASE_CREATE_BACKUP, &e);
                log.abort();
                self.logger.update(&log).await;
                return MigrationOutcome::Failed {
                    migration_id: Some(log.id),
                    error: e.to_string(),
                    rollback_completed: false,
                };
            }
        };
        log.backup_id = Some(backup.id.clone());
        self.logger.update(&log).await;

        let mut degraded = validation.degraded;
        let ctx = StepContext {
            store: self.records.clone(),
            checker: self.checker.clone(),
            backfiller: self.backfiller.clone(),
            from_version: from,
            to_version: target,
        };

        for step in self.checker.steps_for(from, target) {
            let Some(handler) = self.registry.get(&step.name) else {
                let e = MigrationError::UnknownStep { step: step.name.clone() };
                log.record_error(&step.name, &e);
                return self.roll_back(log, &backup, e).await;
            };

            tracing::debug!(migration_id = %log.id, step = %step.name, "running step");
            match handler.run(&ctx).await {
                Ok(report) => {
                    if let Some(processed) = report.processed {
                        log.add_processed(processed);
                    }
                    degraded.extend(report.degraded);
                    self.logger.update(&log).await;
                }
                Err(e) => {
                    tracing::error!(migration_id = %log.id, step = %step.name, error = %e, "step failed");
                    log.record_error(&step.name, &e);
                    return self.roll_back(log, &backup, e).await;
                }
            }
        }

        match self.validator.check_data_integrity().await {
            Ok(report) if report.is_valid => {}
            Ok(report) => {
                let e = MigrationError::DataCorruption {
                    corrupted_cards: report.corrupted_cards,
                    total_cards: report.total_cards,
                };
                log.record_error(PHASE_INTEGRITY_CHECK, &e);
                return self.roll_back(log, &backup, e).await;
            }
            Err(e) => {
                log.record_error(PHASE_INTEGRITY_CHECK, &e);
                return self.roll_back(log, &backup, e).await;
            }
        }

        if let Err(e) = self
            .marker
            .set(&self.config.version_marker_key, &target.to_string())
            .await
        {
            let e = MigrationError::from(e);
            log.record_error(PHASE_COMMIT_VERSION, &e);
            return self.roll_back(log, &backup, e).await;
        }

        log.complete();
        self.logger.update(&log).await;

        if let Some(keep) = self.config.backup_retention {
            if let Err(e) = self.backups.prune(keep).await {
                tracing::warn!(migration_id = %log.id, error = %e, "backup pruning failed");
            }
        }

        degraded.sort();
        degraded.dedup();
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            migration_id = %log.id,
            from_version = from,
            to_version = target,
            processed_cards = log.processed_cards,
            duration_ms,
            "migration completed"
        );

        MigrationOutcome::Completed {
            migration_id: log.id,
            from_version: from,
            to_version: target,
            processed_cards: log.processed_cards,
            duration_ms,
            degraded,
        }
    }

    /// Restore the backup and finalize the log as rolled back.
    async fn roll_back(
        &self,
        mut log: MigrationLog,
        backup: &Backup,
        cause: MigrationError,
    ) -> MigrationOutcome {
        tracing::error!(
            migration_id = %log.id,
            backup_id = %backup.id,
            error = %cause,
            "rolling back migration"
        );

        let restored = match self.backups.restore(backup).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(migration_id = %log.id, backup_id = %backup.id, error = %e, "restore failed");
                log.record_error(PHASE_RESTORE_BACKUP, &e);
                false
            }
        };

        log.rollback();
        self.logger.update(&log).await;

        let error = match log.errors.last() {
            Some(last) if !restored => format!("{}; {}", cause, last.error),
            _ => cause.to_string(),
        };
        MigrationOutcome::Failed {
            migration_id: Some(log.id),
            error,
            rollback_completed: restored,
        }
    }
}
