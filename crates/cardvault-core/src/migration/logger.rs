//! Best-effort migration audit log.
//!
//! Logging must never change the outcome of a migration, so every write
//! failure is reported through tracing and swallowed.

use std::sync::Arc;

use super::error::MigrationError;
use super::state::MigrationLog;
use crate::storage::MigrationLogRepository;

/// Writes migration log entries, tolerating a missing log table.
pub struct MigrationLogger {
    repo: Arc<dyn MigrationLogRepository>,
}

impl MigrationLogger {
    /// Create a logger.
    pub fn new(repo: Arc<dyn MigrationLogRepository>) -> Self {
        Self { repo }
    }

    /// Record a new entry. Returns whether the write succeeded.
    pub async fn append(&self, log: &MigrationLog) -> bool {
        self.write(log, "append").await
    }

    /// Overwrite an existing entry. Returns whether the write succeeded.
    pub async fn update(&self, log: &MigrationLog) -> bool {
        self.write(log, "update").await
    }

    async fn write(&self, log: &MigrationLog, op: &'static str) -> bool {
        match self.repo.put_log(log).await {
            Ok(()) => {
                tracing::debug!(migration_id = %log.id, status = %log.status, op, "migration log written");
                true
            }
            Err(e) if e.is_table_missing() => {
                tracing::warn!(migration_id = %log.id, op, "migration log table missing, entry not recorded");
                false
            }
            Err(e) => {
                tracing::warn!(migration_id = %log.id, op, error = %e, "failed to write migration log");
                false
            }
        }
    }

    /// Every recorded entry, oldest first.
    pub async fn history(&self) -> Result<Vec<MigrationLog>, MigrationError> {
        let mut logs = self.repo.list_logs().await?;
        logs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(logs)
    }

    /// Load one entry.
    pub async fn get(&self, id: &str) -> Result<Option<MigrationLog>, MigrationError> {
        Ok(self.repo.get_log(id).await?)
    }
}
