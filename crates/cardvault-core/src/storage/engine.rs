//! Sled-backed implementation of the record, backup, and log repositories.

use async_trait::async_trait;
use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};

use super::key::{decode_index_catalog_key, index_catalog_key, index_entry_key, index_tree_name};
use super::quota::SledQuotaEstimator;
use super::record::{Card, StoredRow, VersionEntry};
use super::repository::{
    BackupRepository, MigrationLogRepository, RecordStore, BACKUPS_TABLE, CARDS_TABLE,
    MIGRATION_LOG_TABLE, VERSIONS_TABLE,
};
use super::StorageConfig;
use crate::error::Error;
use crate::migration::{Backup, MigrationLog};

/// Tree name for the declared-index catalog.
const INDEX_CATALOG_TREE: &str = "meta:indexes";

/// The main storage engine wrapping sled.
pub struct StorageEngine {
    /// The underlying sled database.
    db: Db,

    /// Live cards, keyed by card id.
    cards_tree: Tree,

    /// Card version history, keyed by entry id.
    versions_tree: Tree,

    /// Backups, keyed by backup id.
    backups_tree: Tree,

    /// Declared indexes (`table/index` -> empty).
    index_catalog: Tree,

    /// Migration log tree, present once created.
    migration_log_tree: RwLock<Option<Tree>>,

    /// Quota used for space estimates.
    quota_bytes: Option<u64>,
}

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self, Error> {
        let db = config.to_sled_config().open()?;
        let cards_tree = db.open_tree(CARDS_TABLE)?;
        let versions_tree = db.open_tree(VERSIONS_TABLE)?;
        let backups_tree = db.open_tree(BACKUPS_TABLE)?;
        let index_catalog = db.open_tree(INDEX_CATALOG_TREE)?;

        // The log tree is only opened if an earlier run created it.
        let log_exists = db
            .tree_names()
            .iter()
            .any(|name| name.as_ref() == MIGRATION_LOG_TABLE.as_bytes());
        let migration_log_tree = if log_exists {
            Some(db.open_tree(MIGRATION_LOG_TABLE)?)
        } else {
            None
        };

        tracing::debug!(
            recovered = db.was_recovered(),
            log_table = log_exists,
            "storage engine opened"
        );

        Ok(Self {
            db,
            cards_tree,
            versions_tree,
            backups_tree,
            index_catalog,
            migration_log_tree: RwLock::new(migration_log_tree),
            quota_bytes: config.quota_bytes,
        })
    }

    /// Check if the database was recovered from a previous run.
    pub fn was_recovered(&self) -> bool {
        self.db.was_recovered()
    }

    /// Quota estimator over this database's on-disk size.
    pub fn quota_estimator(&self) -> SledQuotaEstimator {
        SledQuotaEstimator::new(self.db.clone(), self.quota_bytes)
    }

    /// Number of live cards.
    pub fn card_count(&self) -> usize {
        self.cards_tree.len()
    }

    /// Look up card ids by an indexed value.
    pub fn lookup(&self, table: &str, index: &str, value: &str) -> Result<Vec<String>, Error> {
        if !self.index_catalog.contains_key(index_catalog_key(table, index))? {
            return Err(Error::NotFound(format!("index {}.{}", table, index)));
        }
        let tree = self.db.open_tree(index_tree_name(table, index))?;
        let mut prefix = value.as_bytes().to_vec();
        prefix.push(0);

        let mut ids = Vec::new();
        for result in tree.scan_prefix(&prefix) {
            let (key, _) = result?;
            let id = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| Error::InvalidData(e.to_string()))?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<(), Error> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn log_tree(&self) -> Option<Tree> {
        self.migration_log_tree.read().clone()
    }

    fn table_tree(&self, table: &str) -> Result<Tree, Error> {
        match table {
            CARDS_TABLE => Ok(self.cards_tree.clone()),
            VERSIONS_TABLE => Ok(self.versions_tree.clone()),
            BACKUPS_TABLE => Ok(self.backups_tree.clone()),
            MIGRATION_LOG_TABLE => self
                .log_tree()
                .ok_or_else(|| Error::TableMissing(MIGRATION_LOG_TABLE.to_string())),
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }

    fn declared_indexes(&self, table: &str) -> Result<Vec<String>, Error> {
        let mut prefix = table.as_bytes().to_vec();
        prefix.push(b'/');

        let mut names = Vec::new();
        for result in self.index_catalog.scan_prefix(&prefix) {
            let (key, _) = result?;
            if let Some((_, index)) = decode_index_catalog_key(&key) {
                names.push(index);
            }
        }
        Ok(names)
    }

    /// Open the trees materializing every declared index of a table.
    fn index_trees(&self, table: &str) -> Result<Vec<(String, Tree)>, Error> {
        self.declared_indexes(table)?
            .into_iter()
            .map(|index| -> Result<(String, Tree), Error> {
                let tree = self.db.open_tree(index_tree_name(table, &index))?;
                Ok((index, tree))
            })
            .collect()
    }

    /// Indexed value of a raw row, if it has one.
    fn index_value(table: &str, index: &str, bytes: &[u8]) -> Option<String> {
        match table {
            CARDS_TABLE => Card::from_bytes(bytes).ok()?.index_value(index),
            VERSIONS_TABLE => VersionEntry::from_bytes(bytes).ok()?.index_value(index),
            MIGRATION_LOG_TABLE => serde_json::from_slice::<MigrationLog>(bytes)
                .ok()?
                .index_value(index),
            _ => None,
        }
    }

    fn rebuild_index(&self, table: &str, index: &str) -> Result<(), Error> {
        let source = self.table_tree(table)?;
        let tree = self.db.open_tree(index_tree_name(table, index))?;
        tree.clear()?;

        let mut batch = sled::Batch::default();
        for result in source.iter() {
            let (key, value) = result?;
            // Entries point at the storage key, which may differ from a
            // malformed record's own id.
            let Ok(id) = std::str::from_utf8(&key) else {
                continue;
            };
            if let Some(indexed) = Self::index_value(table, index, &value) {
                batch.insert(index_entry_key(&indexed, id), &[]);
            }
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    fn rows(tree: &Tree) -> Result<Vec<StoredRow>, Error> {
        tree.iter()
            .map(|result| -> Result<StoredRow, Error> {
                let (key, value) = result?;
                StoredRow::from_raw(&key, &value)
            })
            .collect()
    }

    /// Write a row under an arbitrary key, bypassing validation and indexes.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, table: &str, key: &str, value: &[u8]) -> Result<(), Error> {
        self.table_tree(table)?.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn run_transaction<F>(trees: &[Tree], f: F) -> Result<(), Error>
    where
        F: Fn(&[TransactionalTree]) -> Result<(), ConflictableTransactionError<Error>>,
    {
        let result: Result<(), TransactionError<Error>> = trees.transaction(|txs| f(txs));
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
        }
    }
}

#[async_trait]
impl RecordStore for StorageEngine {
    async fn list_cards(&self) -> Result<Vec<Card>, Error> {
        self.cards_tree
            .iter()
            .map(|result| {
                let (_, value) = result?;
                Card::from_bytes(&value)
            })
            .collect()
    }

    async fn list_version_history(&self) -> Result<Vec<VersionEntry>, Error> {
        self.versions_tree
            .iter()
            .map(|result| {
                let (_, value) = result?;
                VersionEntry::from_bytes(&value)
            })
            .collect()
    }

    async fn card_rows(&self) -> Result<Vec<StoredRow>, Error> {
        Self::rows(&self.cards_tree)
    }

    async fn version_rows(&self) -> Result<Vec<StoredRow>, Error> {
        Self::rows(&self.versions_tree)
    }

    async fn put_card(&self, card: &Card) -> Result<(), Error> {
        if card.id.is_empty() {
            return Err(Error::InvalidData("card id must not be empty".to_string()));
        }
        let previous = match self.cards_tree.get(card.id.as_bytes())? {
            Some(bytes) => Card::from_bytes(&bytes).ok(),
            None => None,
        };
        let value = card.to_bytes()?;

        let indexes = self.index_trees(CARDS_TABLE)?;
        let mut trees = Vec::with_capacity(indexes.len() + 1);
        trees.push(self.cards_tree.clone());
        trees.extend(indexes.iter().map(|(_, tree)| tree.clone()));

        Self::run_transaction(&trees, |txs| {
            txs[0].insert(card.id.as_bytes(), value.as_slice())?;
            for (slot, (index, _)) in indexes.iter().enumerate() {
                let tx = &txs[slot + 1];
                if let Some(old) = previous.as_ref().and_then(|p| p.index_value(index)) {
                    tx.remove(index_entry_key(&old, &card.id))?;
                }
                if let Some(new) = card.index_value(index) {
                    tx.insert(index_entry_key(&new, &card.id), &[])?;
                }
            }
            Ok(())
        })
    }

    async fn put_version(&self, entry: &VersionEntry) -> Result<(), Error> {
        let value = entry.to_bytes()?;
        let indexes = self.index_trees(VERSIONS_TABLE)?;
        let mut trees = Vec::with_capacity(indexes.len() + 1);
        trees.push(self.versions_tree.clone());
        trees.extend(indexes.iter().map(|(_, tree)| tree.clone()));

        Self::run_transaction(&trees, |txs| {
            txs[0].insert(entry.id.as_bytes(), value.as_slice())?;
            for (slot, (index, _)) in indexes.iter().enumerate() {
                if let Some(v) = entry.index_value(index) {
                    txs[slot + 1].insert(index_entry_key(&v, &entry.id), &[])?;
                }
            }
            Ok(())
        })
    }

    async fn table_names(&self) -> Result<Vec<String>, Error> {
        let mut names = vec![
            CARDS_TABLE.to_string(),
            VERSIONS_TABLE.to_string(),
            BACKUPS_TABLE.to_string(),
        ];
        if self.log_tree().is_some() {
            names.push(MIGRATION_LOG_TABLE.to_string());
        }
        Ok(names)
    }

    async fn index_names(&self, table: &str) -> Result<Vec<String>, Error> {
        self.table_tree(table)?;
        self.declared_indexes(table)
    }

    async fn create_table(&self, table: &str) -> Result<(), Error> {
        match table {
            CARDS_TABLE | VERSIONS_TABLE | BACKUPS_TABLE => Ok(()),
            MIGRATION_LOG_TABLE => {
                let mut guard = self.migration_log_tree.write();
                if guard.is_none() {
                    *guard = Some(self.db.open_tree(MIGRATION_LOG_TABLE)?);
                    tracing::info!(table, "created table");
                }
                Ok(())
            }
            other => Err(Error::UnknownTable(other.to_string())),
        }
    }

    async fn create_index(&self, table: &str, index: &str) -> Result<(), Error> {
        self.table_tree(table)?;
        let key = index_catalog_key(table, index);
        if self.index_catalog.contains_key(&key)? {
            return Ok(());
        }
        self.rebuild_index(table, index)?;
        self.index_catalog.insert(key, &[])?;
        tracing::info!(table, index, "created index");
        Ok(())
    }

    async fn drop_index(&self, table: &str, index: &str) -> Result<(), Error> {
        let key = index_catalog_key(table, index);
        if self.index_catalog.remove(&key)?.is_none() {
            return Ok(());
        }
        self.db.drop_tree(index_tree_name(table, index))?;
        tracing::info!(table, index, "dropped index");
        Ok(())
    }

    async fn replace_tables(&self, cards: &[StoredRow], versions: &[StoredRow]) -> Result<(), Error> {
        let card_indexes = self.index_trees(CARDS_TABLE)?;
        let version_indexes = self.index_trees(VERSIONS_TABLE)?;

        // Every key currently present must be removed inside the transaction.
        let mut existing: Vec<Vec<sled::IVec>> = Vec::new();
        let mut trees = vec![self.cards_tree.clone(), self.versions_tree.clone()];
        trees.extend(card_indexes.iter().map(|(_, t)| t.clone()));
        trees.extend(version_indexes.iter().map(|(_, t)| t.clone()));
        for tree in &trees {
            let keys = tree
                .iter()
                .keys()
                .collect::<Result<Vec<_>, sled::Error>>()?;
            existing.push(keys);
        }

        let encode = |rows: &[StoredRow]| -> Result<Vec<(String, Vec<u8>)>, Error> {
            rows.iter()
                .map(|row| -> Result<(String, Vec<u8>), Error> {
                    Ok((row.key.clone(), serde_json::to_vec(&row.value)?))
                })
                .collect()
        };
        let card_rows = encode(cards)?;
        let version_rows = encode(versions)?;

        // (tree slot, entry key) for every index entry the new rows produce.
        let mut entries: Vec<(usize, Vec<u8>)> = Vec::new();
        let card_offset = 2;
        for (slot, (index, _)) in card_indexes.iter().enumerate() {
            for (key, bytes) in &card_rows {
                if let Some(v) = Self::index_value(CARDS_TABLE, index, bytes) {
                    entries.push((card_offset + slot, index_entry_key(&v, key)));
                }
            }
        }
        let version_offset = card_offset + card_indexes.len();
        for (slot, (index, _)) in version_indexes.iter().enumerate() {
            for (key, bytes) in &version_rows {
                if let Some(v) = Self::index_value(VERSIONS_TABLE, index, bytes) {
                    entries.push((version_offset + slot, index_entry_key(&v, key)));
                }
            }
        }

        Self::run_transaction(&trees, |txs| {
            for (tx, keys) in txs.iter().zip(existing.iter()) {
                for key in keys {
                    tx.remove(key.clone())?;
                }
            }
            for (key, bytes) in &card_rows {
                txs[0].insert(key.as_bytes(), bytes.as_slice())?;
            }
            for (key, bytes) in &version_rows {
                txs[1].insert(key.as_bytes(), bytes.as_slice())?;
            }
            for (slot, entry) in &entries {
                txs[*slot].insert(entry.clone(), &[])?;
            }
            Ok(())
        })?;

        tracing::debug!(
            cards = cards.len(),
            versions = versions.len(),
            "replaced live tables"
        );
        Ok(())
    }
}

#[async_trait]
impl BackupRepository for StorageEngine {
    async fn put_backup(&self, backup: &Backup) -> Result<(), Error> {
        let value = serde_json::to_vec(backup)?;
        self.backups_tree.insert(backup.id.as_bytes(), value)?;
        self.backups_tree.flush_async().await?;
        Ok(())
    }

    async fn get_backup(&self, id: &str) -> Result<Option<Backup>, Error> {
        match self.backups_tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_backups(&self) -> Result<Vec<Backup>, Error> {
        self.backups_tree
            .iter()
            .map(|result| -> Result<Backup, Error> {
                let (_, value) = result?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }

    async fn delete_backup(&self, id: &str) -> Result<(), Error> {
        self.backups_tree.remove(id.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl MigrationLogRepository for StorageEngine {
    async fn put_log(&self, log: &MigrationLog) -> Result<(), Error> {
        self.create_table(MIGRATION_LOG_TABLE).await?;
        let tree = self
            .log_tree()
            .ok_or_else(|| Error::TableMissing(MIGRATION_LOG_TABLE.to_string()))?;

        let previous = tree
            .get(log.id.as_bytes())?
            .and_then(|bytes| serde_json::from_slice::<MigrationLog>(&bytes).ok());
        let value = serde_json::to_vec(log)?;

        let indexes = self.index_trees(MIGRATION_LOG_TABLE)?;
        let mut trees = Vec::with_capacity(indexes.len() + 1);
        trees.push(tree);
        trees.extend(indexes.iter().map(|(_, t)| t.clone()));

        Self::run_transaction(&trees, |txs| {
            txs[0].insert(log.id.as_bytes(), value.as_slice())?;
            for (slot, (index, _)) in indexes.iter().enumerate() {
                if let Some(old) = previous.as_ref().and_then(|p| p.index_value(index)) {
                    txs[slot + 1].remove(index_entry_key(&old, &log.id))?;
                }
                if let Some(new) = log.index_value(index) {
                    txs[slot + 1].insert(index_entry_key(&new, &log.id), &[])?;
                }
            }
            Ok(())
        })
    }

    async fn get_log(&self, id: &str) -> Result<Option<MigrationLog>, Error> {
        let Some(tree) = self.log_tree() else {
            return Ok(None);
        };
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_logs(&self) -> Result<Vec<MigrationLog>, Error> {
        let Some(tree) = self.log_tree() else {
            return Ok(Vec::new());
        };
        tree.iter()
            .map(|result| -> Result<MigrationLog, Error> {
                let (_, value) = result?;
                Ok(serde_json::from_slice(&value)?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_engine() -> StorageEngine {
        StorageEngine::open(StorageConfig::temporary()).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_list_cards() {
        let engine = test_engine();
        engine.put_card(&Card::new("b", json!({"name": "Bob"}))).await.unwrap();
        engine.put_card(&Card::new("a", json!({"name": "Ada"}))).await.unwrap();

        let cards = engine.list_cards().await.unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].id, "a");
        assert_eq!(engine.card_count(), 2);
    }

    #[tokio::test]
    async fn test_put_card_rejects_empty_id() {
        let engine = test_engine();
        let result = engine.put_card(&Card::new("", json!({"name": "x"}))).await;
        assert!(matches!(result, Err(Error::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_log_table_created_lazily() {
        let engine = test_engine();
        let tables = engine.table_names().await.unwrap();
        assert!(!tables.contains(&MIGRATION_LOG_TABLE.to_string()));
        assert!(engine.list_logs().await.unwrap().is_empty());

        let log = MigrationLog::new("migration_1", 2, 3);
        engine.put_log(&log).await.unwrap();

        let tables = engine.table_names().await.unwrap();
        assert!(tables.contains(&MIGRATION_LOG_TABLE.to_string()));
        assert_eq!(engine.get_log("migration_1").await.unwrap(), Some(log));
    }

    #[tokio::test]
    async fn test_index_on_missing_table() {
        let engine = test_engine();
        let result = engine.create_index(MIGRATION_LOG_TABLE, "status").await;
        assert!(matches!(result, Err(Error::TableMissing(_))));
        let result = engine.index_names("contacts").await;
        assert!(matches!(result, Err(Error::UnknownTable(_))));
    }

    #[tokio::test]
    async fn test_create_index_builds_and_maintains_entries() {
        let engine = test_engine();
        engine
            .put_card(&Card::new("a", json!({"name": "Ada"})).with_fingerprint("fp_aaaaaaaa"))
            .await
            .unwrap();

        engine.create_index(CARDS_TABLE, "fingerprint").await.unwrap();
        engine.create_index(CARDS_TABLE, "fingerprint").await.unwrap();
        assert_eq!(engine.index_names(CARDS_TABLE).await.unwrap(), vec!["fingerprint"]);
        assert_eq!(engine.lookup(CARDS_TABLE, "fingerprint", "fp_aaaaaaaa").unwrap(), vec!["a"]);

        // Re-fingerprinting moves the index entry.
        engine
            .put_card(&Card::new("a", json!({"name": "Ada"})).with_fingerprint("fp_bbbbbbbb"))
            .await
            .unwrap();
        assert!(engine.lookup(CARDS_TABLE, "fingerprint", "fp_aaaaaaaa").unwrap().is_empty());
        assert_eq!(engine.lookup(CARDS_TABLE, "fingerprint", "fp_bbbbbbbb").unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_replace_tables_swaps_contents_and_indexes() {
        let engine = test_engine();
        engine.create_index(CARDS_TABLE, "created").await.unwrap();
        engine.put_card(&Card::new("old", json!({"name": "Old"}))).await.unwrap();
        engine
            .put_version(&VersionEntry::new("v-old", "old", 1, json!({"name": "Old"})))
            .await
            .unwrap();

        let fresh = Card::new("new", json!({"name": "New"}));
        let entry = VersionEntry::new("v-new", "new", 1, json!({"name": "New"}));
        engine
            .replace_tables(
                &[StoredRow::from_card(&fresh).unwrap()],
                &[StoredRow::from_version(&entry).unwrap()],
            )
            .await
            .unwrap();

        assert_eq!(engine.list_cards().await.unwrap(), vec![fresh.clone()]);
        assert_eq!(engine.list_version_history().await.unwrap(), vec![entry]);
        let created = fresh.created.clone().unwrap();
        assert_eq!(engine.lookup(CARDS_TABLE, "created", &created).unwrap(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_rows_keep_storage_keys() {
        let engine = test_engine();
        engine.create_index(CARDS_TABLE, "created").await.unwrap();
        engine
            .insert_raw(CARDS_TABLE, "k1", br#"{"data":{"name":"A"},"created":"2024-01-01T00:00:00Z"}"#)
            .unwrap();
        engine
            .insert_raw(CARDS_TABLE, "k2", br#"{"data":{"name":"B"},"created":"2024-01-01T00:00:00Z"}"#)
            .unwrap();

        let rows = engine.card_rows().await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);

        engine.clear_tables().await.unwrap();
        engine.replace_tables(&rows, &[]).await.unwrap();
        assert_eq!(engine.card_rows().await.unwrap(), rows);
        assert_eq!(
            engine.lookup(CARDS_TABLE, "created", "2024-01-01T00:00:00Z").unwrap(),
            vec!["k1", "k2"]
        );
    }

    #[tokio::test]
    async fn test_drop_index() {
        let engine = test_engine();
        engine.create_index(CARDS_TABLE, "fingerprint").await.unwrap();
        engine.drop_index(CARDS_TABLE, "fingerprint").await.unwrap();
        assert!(engine.index_names(CARDS_TABLE).await.unwrap().is_empty());
        assert!(matches!(
            engine.lookup(CARDS_TABLE, "fingerprint", "fp_aaaaaaaa"),
            Err(Error::NotFound(_))
        ));
        engine.drop_index(CARDS_TABLE, "fingerprint").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_tables() {
        let engine = test_engine();
        engine.put_card(&Card::new("a", json!({"name": "Ada"}))).await.unwrap();
        engine.clear_tables().await.unwrap();
        assert!(engine.list_cards().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reopen_keeps_log_table() {
        let dir = tempfile::tempdir().unwrap();
        {
            let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
            engine.put_log(&MigrationLog::new("m1", 1, 2)).await.unwrap();
            engine.flush().await.unwrap();
        }
        let engine = StorageEngine::open(StorageConfig::new(dir.path())).unwrap();
        assert_eq!(engine.list_logs().await.unwrap().len(), 1);
    }
}
