//! Repository traits the migration engine is written against.
//!
//! The engine never touches a concrete store directly. Everything it reads
//! or writes goes through these traits so tests can substitute fakes.

use async_trait::async_trait;
use serde_json::Value;

use super::record::{compute_checksum, Card, StoredRow, VersionEntry};
use crate::error::Error;
use crate::migration::{Backup, MigrationLog};

/// Table holding the live cards.
pub const CARDS_TABLE: &str = "cards";

/// Table holding card version history.
pub const VERSIONS_TABLE: &str = "versions";

/// Table holding pre-migration snapshots.
pub const BACKUPS_TABLE: &str = "backups";

/// Table holding migration audit entries. Created lazily.
pub const MIGRATION_LOG_TABLE: &str = "migration_log";

/// Tables whose contents a migration may change and a backup must cover.
pub const MUTABLE_TABLES: [&str; 2] = [CARDS_TABLE, VERSIONS_TABLE];

/// Live record tables plus schema introspection.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All cards, in id order.
    async fn list_cards(&self) -> Result<Vec<Card>, Error>;

    /// All version history entries, in id order.
    async fn list_version_history(&self) -> Result<Vec<VersionEntry>, Error>;

    /// Every `cards` row as stored, in key order.
    async fn card_rows(&self) -> Result<Vec<StoredRow>, Error>;

    /// Every `versions` row as stored, in key order.
    async fn version_rows(&self) -> Result<Vec<StoredRow>, Error>;

    /// Insert or replace a card.
    async fn put_card(&self, card: &Card) -> Result<(), Error>;

    /// Insert or replace a version history entry.
    async fn put_version(&self, entry: &VersionEntry) -> Result<(), Error>;

    /// Checksum of a card payload.
    fn calculate_checksum(&self, payload: &Value) -> String {
        compute_checksum(payload)
    }

    /// Names of all tables that currently exist.
    async fn table_names(&self) -> Result<Vec<String>, Error>;

    /// Names of the indexes declared on a table.
    async fn index_names(&self, table: &str) -> Result<Vec<String>, Error>;

    /// Create a table if it does not exist.
    async fn create_table(&self, table: &str) -> Result<(), Error>;

    /// Declare and build an index. Idempotent.
    async fn create_index(&self, table: &str, index: &str) -> Result<(), Error>;

    /// Drop a declared index and its entries. Missing indexes are ignored.
    async fn drop_index(&self, table: &str, index: &str) -> Result<(), Error>;

    /// Atomically clear `cards` and `versions` and repopulate them, each row
    /// under its own key.
    async fn replace_tables(&self, cards: &[StoredRow], versions: &[StoredRow]) -> Result<(), Error>;

    /// Atomically clear `cards` and `versions`.
    async fn clear_tables(&self) -> Result<(), Error> {
        self.replace_tables(&[], &[]).await
    }
}

/// Durable storage for backups.
#[async_trait]
pub trait BackupRepository: Send + Sync {
    /// Persist a backup under its id.
    async fn put_backup(&self, backup: &Backup) -> Result<(), Error>;

    /// Load a backup by id.
    async fn get_backup(&self, id: &str) -> Result<Option<Backup>, Error>;

    /// All backups, oldest first.
    async fn list_backups(&self) -> Result<Vec<Backup>, Error>;

    /// Delete a backup. Missing ids are ignored.
    async fn delete_backup(&self, id: &str) -> Result<(), Error>;
}

/// Durable storage for migration audit entries.
#[async_trait]
pub trait MigrationLogRepository: Send + Sync {
    /// Insert or replace a log entry keyed by its id.
    ///
    /// Returns [`Error::TableMissing`] when the log table cannot be written.
    async fn put_log(&self, log: &MigrationLog) -> Result<(), Error>;

    /// Load a log entry by id.
    async fn get_log(&self, id: &str) -> Result<Option<MigrationLog>, Error>;

    /// All log entries, oldest first.
    async fn list_logs(&self) -> Result<Vec<MigrationLog>, Error>;
}
