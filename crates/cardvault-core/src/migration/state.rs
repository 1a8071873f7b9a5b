//! Migration log entries and their lifecycle.

use serde::{Deserialize, Serialize};

use super::compat::SchemaVersion;
use crate::storage::key::now_rfc3339;

/// Status of a migration log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationLogStatus {
    /// Migration started, not yet finalized.
    Pending,
    /// Migration committed.
    Completed,
    /// Migration failed and the backup was restored (or restore attempted).
    Rollback,
}

impl std::fmt::Display for MigrationLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationLogStatus::Pending => write!(f, "pending"),
            MigrationLogStatus::Completed => write!(f, "completed"),
            MigrationLogStatus::Rollback => write!(f, "rollback"),
        }
    }
}

/// An error recorded against a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    /// Step name (or engine phase such as `create_backup`).
    pub step: String,
    /// Error message.
    pub error: String,
    /// When the error was recorded (RFC 3339).
    pub timestamp: String,
}

/// Audit entry for one migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationLog {
    /// Unique migration id.
    pub id: String,
    /// Target schema version.
    pub migration_version: SchemaVersion,
    /// Source schema version.
    pub from_version: SchemaVersion,
    /// When the migration started (RFC 3339).
    pub start_time: String,
    /// When the migration was finalized (RFC 3339).
    pub end_time: Option<String>,
    /// Current status.
    pub status: MigrationLogStatus,
    /// Backup taken for this attempt.
    #[serde(default)]
    pub backup_id: Option<String>,
    /// Cards present when the migration started.
    pub affected_cards: u64,
    /// Cards processed by counting steps.
    pub processed_cards: u64,
    /// Errors recorded during the attempt.
    pub errors: Vec<StepError>,
}

impl MigrationLog {
    /// Create a pending log entry.
    pub fn new(id: impl Into<String>, from_version: SchemaVersion, to_version: SchemaVersion) -> Self {
        Self {
            id: id.into(),
            migration_version: to_version,
            from_version,
            start_time: now_rfc3339(),
            end_time: None,
            status: MigrationLogStatus::Pending,
            backup_id: None,
            affected_cards: 0,
            processed_cards: 0,
            errors: Vec::new(),
        }
    }

    /// Record an error against a step.
    pub fn record_error(&mut self, step: impl Into<String>, error: impl std::fmt::Display) {
        self.errors.push(StepError {
            step: step.into(),
            error: error.to_string(),
            timestamp: now_rfc3339(),
        });
    }

    /// Add to the processed-card count.
    pub fn add_processed(&mut self, count: u64) {
        self.processed_cards += count;
    }

    /// Finalize as completed.
    pub fn complete(&mut self) {
        self.status = MigrationLogStatus::Completed;
        self.end_time = Some(now_rfc3339());
    }

    /// Finalize as rolled back.
    pub fn rollback(&mut self) {
        self.status = MigrationLogStatus::Rollback;
        self.end_time = Some(now_rfc3339());
    }

    /// Stamp the end time of an attempt that aborted before mutating
    /// anything. The status stays pending.
    pub fn abort(&mut self) {
        self.end_time = Some(now_rfc3339());
    }

    /// Check if the entry has been finalized.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            MigrationLogStatus::Completed | MigrationLogStatus::Rollback
        )
    }

    /// Look up an indexable field value by index name.
    pub fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "id" => Some(self.id.clone()),
            "status" => Some(self.status.to_string()),
            "start_time" => Some(self.start_time.clone()),
            "migration_version" => Some(format!("{:010}", self.migration_version)),
            _ => None,
        }
    }
}
