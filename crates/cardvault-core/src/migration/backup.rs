//! Pre-migration snapshots of the mutable tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::compat::SchemaVersion;
use super::error::MigrationError;
use crate::error::Error;
use crate::storage::key::{generate_id, now_rfc3339};
use crate::storage::{BackupRepository, RecordStore, StoredRow};

/// Declared indexes per table.
pub type IndexCatalog = BTreeMap<String, Vec<String>>;

/// Point-in-time copy of `cards` and `versions` plus the declared indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique backup id.
    pub id: String,
    /// When the snapshot was taken (RFC 3339).
    pub timestamp: String,
    /// Schema version at snapshot time.
    pub db_version: SchemaVersion,
    /// Every `cards` row, under its storage key.
    pub cards: Vec<StoredRow>,
    /// Every `versions` row, under its storage key.
    pub versions: Vec<StoredRow>,
    /// Indexes declared on each existing table.
    #[serde(default)]
    pub indexes: IndexCatalog,
    /// Digest over the snapshot contents.
    pub checksum: String,
}

#[derive(Serialize)]
struct BackupContent<'a> {
    cards: &'a [StoredRow],
    versions: &'a [StoredRow],
    indexes: &'a IndexCatalog,
}

impl Backup {
    /// Digest of a snapshot's contents.
    pub fn content_checksum(
        cards: &[StoredRow],
        versions: &[StoredRow],
        indexes: &IndexCatalog,
    ) -> Result<String, Error> {
        let bytes = serde_json::to_vec(&BackupContent {
            cards,
            versions,
            indexes,
        })?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Check the stored checksum against the contents.
    pub fn verify(&self) -> Result<bool, Error> {
        Ok(Self::content_checksum(&self.cards, &self.versions, &self.indexes)? == self.checksum)
    }
}

/// Creates, restores, and prunes backups.
pub struct BackupManager {
    store: Arc<dyn RecordStore>,
    repo: Arc<dyn BackupRepository>,
}

impl BackupManager {
    /// Create a backup manager.
    pub fn new(store: Arc<dyn RecordStore>, repo: Arc<dyn BackupRepository>) -> Self {
        Self { store, repo }
    }

    /// Snapshot the mutable tables and persist the snapshot durably.
    ///
    /// Any failure is reported as [`MigrationError::BackupFailed`].
    pub async fn create_backup(&self, db_version: SchemaVersion) -> Result<Backup, MigrationError> {
        let backup = self
            .snapshot(db_version)
            .await
            .map_err(|e| MigrationError::BackupFailed { reason: e.to_string() })?;

        self.repo
            .put_backup(&backup)
            .await
            .map_err(|e| MigrationError::BackupFailed { reason: e.to_string() })?;

        tracing::info!(
            backup_id = %backup.id,
            db_version,
            cards = backup.cards.len(),
            versions = backup.versions.len(),
            "backup created"
        );
        Ok(backup)
    }

    async fn snapshot(&self, db_version: SchemaVersion) -> Result<Backup, Error> {
        let cards = self.store.card_rows().await?;
        let versions = self.store.version_rows().await?;
        let indexes = self.index_catalog().await?;
        let checksum = Backup::content_checksum(&cards, &versions, &indexes)?;
        Ok(Backup {
            id: generate_id("backup"),
            timestamp: now_rfc3339(),
            db_version,
            cards,
            versions,
            indexes,
            checksum,
        })
    }

    async fn index_catalog(&self) -> Result<IndexCatalog, Error> {
        let mut catalog = IndexCatalog::new();
        for table in self.store.table_names().await? {
            let mut indexes = self.store.index_names(&table).await?;
            indexes.sort();
            catalog.insert(table, indexes);
        }
        Ok(catalog)
    }

    /// Bring the declared indexes back to the snapshot's catalog.
    ///
    /// Tables created since the snapshot are kept, minus their indexes.
    async fn restore_indexes(&self, snapshot: &IndexCatalog) -> Result<(), Error> {
        let current = self.index_catalog().await?;
        for (table, indexes) in &current {
            let keep = snapshot.get(table);
            for index in indexes {
                if !keep.is_some_and(|k| k.contains(index)) {
                    self.store.drop_index(table, index).await?;
                }
            }
        }
        for (table, indexes) in snapshot {
            let present = current.get(table);
            for index in indexes {
                if !present.is_some_and(|p| p.contains(index)) {
                    self.store.create_table(table).await?;
                    self.store.create_index(table, index).await?;
                }
            }
        }
        Ok(())
    }

    /// Atomically replace the mutable tables with a backup's contents, then
    /// reset the declared indexes to the backup's catalog.
    ///
    /// The backup's checksum is verified first; a tampered backup is never
    /// restored.
    pub async fn restore(&self, backup: &Backup) -> Result<(), MigrationError> {
        let restore_failed = |reason: String| MigrationError::RestoreFailed {
            backup_id: backup.id.clone(),
            reason,
        };

        match backup.verify() {
            Ok(true) => {}
            Ok(false) => return Err(restore_failed("backup checksum mismatch".to_string())),
            Err(e) => return Err(restore_failed(e.to_string())),
        }

        self.store
            .replace_tables(&backup.cards, &backup.versions)
            .await
            .map_err(|e| restore_failed(e.to_string()))?;
        self.restore_indexes(&backup.indexes)
            .await
            .map_err(|e| restore_failed(e.to_string()))?;

        tracing::info!(
            backup_id = %backup.id,
            cards = backup.cards.len(),
            versions = backup.versions.len(),
            "backup restored"
        );
        Ok(())
    }

    /// Load a backup by id and check its checksum.
    pub async fn verify(&self, id: &str) -> Result<bool, MigrationError> {
        let backup = self
            .repo
            .get_backup(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("backup {}", id)))?;
        Ok(backup.verify()?)
    }

    /// The most recent backup.
    pub async fn latest(&self) -> Result<Option<Backup>, MigrationError> {
        Ok(self.list().await?.pop())
    }

    /// All backups, oldest first.
    pub async fn list(&self) -> Result<Vec<Backup>, MigrationError> {
        let mut backups = self.repo.list_backups().await?;
        // Ids are time-ordered and fixed width.
        backups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(backups)
    }

    /// Delete all but the `keep` most recent backups. Returns the number deleted.
    pub async fn prune(&self, keep: usize) -> Result<usize, MigrationError> {
        let backups = self.list().await?;
        let excess = backups.len().saturating_sub(keep);
        for backup in &backups[..excess] {
            self.repo.delete_backup(&backup.id).await?;
            tracing::debug!(backup_id = %backup.id, "pruned backup");
        }
        if excess > 0 {
            tracing::info!(deleted = excess, kept = backups.len() - excess, "pruned backups");
        }
        Ok(excess)
    }
}
