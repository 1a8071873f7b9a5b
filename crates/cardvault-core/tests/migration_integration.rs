//! End-to-end migration tests against the sled store, with fault injection
//! through wrapper repositories.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use cardvault_core::error::Error;
use cardvault_core::migration::{
    BackfillReport, Backup, Collaborators, Degradation, FingerprintBackfiller, MigrationExecutor,
    MigrationLog, MigrationLogStatus, MigrationOutcome, StepContext, StepHandler, StepRegistry,
    StepReport, ADD_FINGERPRINT_INDEXES, GENERATE_MISSING_FINGERPRINTS, PHASE_CREATE_BACKUP,
    PHASE_INTEGRITY_CHECK, PHASE_RESTORE_BACKUP,
};
use cardvault_core::storage::{
    BackupRepository, Card, MemoryVersionMarker, MigrationLogRepository, RecordStore,
    StaticQuotaEstimator, StorageConfig, StorageEngine, StoredRow, VersionEntry, VersionMarker,
    BYTES_PER_MB, CARDS_TABLE, VERSIONS_TABLE,
};
use cardvault_core::{EngineConfig, MigrationError};

const MARKER_KEY: &str = "cardvault_db_version";

/// A version 2 store with `cards` well-formed cards and one version entry each.
async fn store_at_v2(cards: usize) -> Arc<StorageEngine> {
    let engine = Arc::new(StorageEngine::open(StorageConfig::temporary()).unwrap());
    for (table, index) in [
        (CARDS_TABLE, "created"),
        (CARDS_TABLE, "modified"),
        (VERSIONS_TABLE, "card_id"),
        (VERSIONS_TABLE, "timestamp"),
    ] {
        engine.create_index(table, index).await.unwrap();
    }
    for i in 0..cards {
        let data = json!({"name": format!("Card {}", i), "email": format!("card{}@example.com", i)});
        let id = format!("card_{:03}", i);
        engine.put_card(&Card::new(id.clone(), data.clone())).await.unwrap();
        engine
            .put_version(&VersionEntry::new(format!("{}_v1", id), id, 1, data))
            .await
            .unwrap();
    }
    engine
}

fn collaborators(engine: &Arc<StorageEngine>, marker: &Arc<MemoryVersionMarker>) -> Collaborators {
    let mut collaborators = Collaborators::from_engine(engine.clone(), marker.clone());
    collaborators.quota = Arc::new(StaticQuotaEstimator::new(0, 512 * BYTES_PER_MB));
    collaborators
}

fn config() -> EngineConfig {
    EngineConfig::default().with_initial_version(2)
}

async fn snapshot(engine: &StorageEngine) -> (Vec<Card>, Vec<VersionEntry>) {
    (
        engine.list_cards().await.unwrap(),
        engine.list_version_history().await.unwrap(),
    )
}

async fn only_log(executor: &MigrationExecutor) -> MigrationLog {
    let mut history = executor.history().await.unwrap();
    assert_eq!(history.len(), 1, "expected exactly one log entry");
    history.remove(0)
}

// ---- fault injection ----

struct FailingBackfiller;

#[async_trait]
impl FingerprintBackfiller for FailingBackfiller {
    async fn backfill_fingerprints(&self) -> Result<BackfillReport, Error> {
        Err(Error::InvalidData("backfill exploded".to_string()))
    }
}

/// Mutates cards, then fails halfway through.
struct PartialBackfiller {
    store: Arc<StorageEngine>,
}

#[async_trait]
impl FingerprintBackfiller for PartialBackfiller {
    async fn backfill_fingerprints(&self) -> Result<BackfillReport, Error> {
        let cards = self.store.list_cards().await?;
        if let Some(first) = cards.into_iter().next() {
            self.store.put_card(&first.with_fingerprint("fp_deadbeefdeadbeef")).await?;
        }
        Err(Error::Io(std::io::Error::other("connection lost")))
    }
}

struct FailingBackups;

#[async_trait]
impl BackupRepository for FailingBackups {
    async fn put_backup(&self, _backup: &Backup) -> Result<(), Error> {
        Err(Error::Io(std::io::Error::other("disk full")))
    }

    async fn get_backup(&self, _id: &str) -> Result<Option<Backup>, Error> {
        Ok(None)
    }

    async fn list_backups(&self) -> Result<Vec<Backup>, Error> {
        Ok(Vec::new())
    }

    async fn delete_backup(&self, _id: &str) -> Result<(), Error> {
        Ok(())
    }
}

struct NoLogTable;

#[async_trait]
impl MigrationLogRepository for NoLogTable {
    async fn put_log(&self, _log: &MigrationLog) -> Result<(), Error> {
        Err(Error::TableMissing("migration_log".to_string()))
    }

    async fn get_log(&self, _id: &str) -> Result<Option<MigrationLog>, Error> {
        Ok(None)
    }

    async fn list_logs(&self) -> Result<Vec<MigrationLog>, Error> {
        Ok(Vec::new())
    }
}

/// Record store whose bulk replace always fails.
struct NoRestoreStore {
    inner: Arc<StorageEngine>,
}

#[async_trait]
impl RecordStore for NoRestoreStore {
    async fn list_cards(&self) -> Result<Vec<Card>, Error> {
        self.inner.list_cards().await
    }

    async fn list_version_history(&self) -> Result<Vec<VersionEntry>, Error> {
        self.inner.list_version_history().await
    }

    async fn card_rows(&self) -> Result<Vec<StoredRow>, Error> {
        self.inner.card_rows().await
    }

    async fn version_rows(&self) -> Result<Vec<StoredRow>, Error> {
        self.inner.version_rows().await
    }

    async fn put_card(&self, card: &Card) -> Result<(), Error> {
        self.inner.put_card(card).await
    }

    async fn put_version(&self, entry: &VersionEntry) -> Result<(), Error> {
        self.inner.put_version(entry).await
    }

    async fn table_names(&self) -> Result<Vec<String>, Error> {
        self.inner.table_names().await
    }

    async fn index_names(&self, table: &str) -> Result<Vec<String>, Error> {
        self.inner.index_names(table).await
    }

    async fn create_table(&self, table: &str) -> Result<(), Error> {
        self.inner.create_table(table).await
    }

    async fn create_index(&self, table: &str, index: &str) -> Result<(), Error> {
        self.inner.create_index(table, index).await
    }

    async fn drop_index(&self, table: &str, index: &str) -> Result<(), Error> {
        self.inner.drop_index(table, index).await
    }

    async fn replace_tables(&self, _cards: &[StoredRow], _versions: &[StoredRow]) -> Result<(), Error> {
        Err(Error::Io(std::io::Error::other("store is read-only")))
    }
}

/// Overwrites one card's payload without updating its checksum.
struct CorruptingStep;

#[async_trait]
impl StepHandler for CorruptingStep {
    async fn run(&self, ctx: &StepContext) -> Result<StepReport, MigrationError> {
        let mut cards = ctx.store.list_cards().await?;
        if let Some(card) = cards.first_mut() {
            card.data = Some(json!({"name": "garbled"}));
            ctx.store.put_card(card).await?;
        }
        Ok(StepReport {
            processed: Some(1),
            degraded: None,
        })
    }
}

/// Blocks until released, so a second migration can observe the first.
struct GateStep {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StepHandler for GateStep {
    async fn run(&self, _ctx: &StepContext) -> Result<StepReport, MigrationError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(StepReport::default())
    }
}

/// Version marker that refuses writes.
struct ReadOnlyMarker {
    written: AtomicBool,
}

#[async_trait]
impl VersionMarker for ReadOnlyMarker {
    async fn get(&self, _key: &str) -> Result<Option<String>, Error> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<(), Error> {
        self.written.store(true, Ordering::SeqCst);
        Err(Error::Io(std::io::Error::other("marker is read-only")))
    }
}

// ---- scenarios ----

#[tokio::test]
async fn test_scenario_a_v2_to_v3_completes() {
    let engine = store_at_v2(10).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::new(collaborators(&engine, &marker), config());

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Completed {
        migration_id,
        from_version,
        to_version,
        processed_cards,
        degraded,
        ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!((from_version, to_version), (2, 3));
    assert_eq!(processed_cards, 10);
    assert!(degraded.is_empty());

    assert_eq!(marker.get(MARKER_KEY).await.unwrap().as_deref(), Some("3"));

    let log = only_log(&executor).await;
    assert_eq!(log.id, migration_id);
    assert_eq!(log.status, MigrationLogStatus::Completed);
    assert_eq!(log.affected_cards, 10);
    assert_eq!(log.processed_cards, 10);
    assert!(log.errors.is_empty());
    assert!(log.end_time.is_some());

    let indexes = executor.validator().validate_indexes(3).await.unwrap();
    assert!(indexes.is_valid);
    let cards = engine.list_cards().await.unwrap();
    assert!(cards.iter().all(|c| c.fingerprint.is_some()));
    let fingerprint = cards[0].fingerprint.clone().unwrap();
    assert_eq!(
        engine.lookup(CARDS_TABLE, "fingerprint", &fingerprint).unwrap(),
        vec![cards[0].id.clone()]
    );
}

#[tokio::test]
async fn test_scenario_b_corruption_is_only_a_warning_before_migration() {
    let engine = store_at_v2(4).await;
    let mut broken = Card::new("broken", json!({"name": "No Date"}));
    broken.created = None;
    engine.put_card(&broken).await.unwrap();

    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::new(collaborators(&engine, &marker), config());

    let report = executor.validator().check_data_integrity().await.unwrap();
    assert_eq!(report.corrupted_cards, 1);
    assert_eq!(report.total_cards, 5);
    assert!(!report.is_valid);

    let validation = executor.validate_migration(2, 3).await;
    assert!(validation.is_valid, "{:?}", validation.errors);
    assert!(validation.errors.is_empty());
    assert!(validation.warnings.iter().any(|w| w.contains("broken")));
}

#[tokio::test]
async fn test_scenario_c_backfill_failure_rolls_back() {
    let engine = store_at_v2(6).await;
    let before = snapshot(&engine).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let collaborators = collaborators(&engine, &marker).with_backfiller(Arc::new(PartialBackfiller {
        store: engine.clone(),
    }));
    let executor = MigrationExecutor::new(collaborators, config());

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Failed {
        migration_id,
        error,
        rollback_completed,
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(rollback_completed);
    assert!(migration_id.is_some());
    assert!(error.contains(GENERATE_MISSING_FINGERPRINTS));

    let log = only_log(&executor).await;
    assert_eq!(log.status, MigrationLogStatus::Rollback);
    assert_eq!(log.errors.len(), 1);
    assert_eq!(log.errors[0].step, GENERATE_MISSING_FINGERPRINTS);
    assert!(log.backup_id.is_some());

    assert_eq!(snapshot(&engine).await, before);
    // The fingerprint index added by the first step is gone again.
    let mut indexes = engine.index_names(CARDS_TABLE).await.unwrap();
    indexes.sort();
    assert_eq!(indexes, vec!["created", "modified"]);
    assert!(marker.get(MARKER_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scenario_d_unsupported_path() {
    let engine = store_at_v2(2).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::new(collaborators(&engine, &marker), config());

    let validation = executor.validate_migration(5, 1).await;
    assert!(!validation.is_valid);
    assert_eq!(validation.errors, vec!["unsupported migration path: 5 -> 1"]);
    assert!(validation.warnings.is_empty());
    assert!(validation.required_actions.is_empty());
    assert!(validation.affected_stores.is_empty());
}

// ---- properties ----

#[tokio::test]
async fn test_backup_failure_leaves_tables_untouched() {
    let engine = store_at_v2(5).await;
    let before = snapshot(&engine).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let mut collaborators = collaborators(&engine, &marker);
    collaborators.backups = Arc::new(FailingBackups);
    let executor = MigrationExecutor::new(collaborators, config());

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Failed {
        migration_id,
        error,
        rollback_completed,
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(!rollback_completed);
    assert!(error.contains("disk full"));

    let log = only_log(&executor).await;
    assert_eq!(Some(log.id), migration_id);
    assert_eq!(log.status, MigrationLogStatus::Pending);
    assert!(log.end_time.is_some());
    assert_eq!(log.errors.len(), 1);
    assert_eq!(log.errors[0].step, PHASE_CREATE_BACKUP);

    assert_eq!(snapshot(&engine).await, before);
    assert_eq!(engine.index_names(CARDS_TABLE).await.unwrap().len(), 2);
    assert!(marker.get(MARKER_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn test_commit_gate_failure_restores_snapshot() {
    let engine = store_at_v2(3).await;
    let before = snapshot(&engine).await;
    let marker = Arc::new(MemoryVersionMarker::new());

    let mut registry = StepRegistry::with_builtin();
    registry.register(ADD_FINGERPRINT_INDEXES, CorruptingStep);
    let executor = MigrationExecutor::with_registry(collaborators(&engine, &marker), config(), registry);

    let outcome = executor.perform_safe_migration(3).await;
    assert!(matches!(
        outcome,
        MigrationOutcome::Failed {
            rollback_completed: true,
            ..
        }
    ));

    let log = only_log(&executor).await;
    assert_eq!(log.status, MigrationLogStatus::Rollback);
    assert_eq!(log.errors.len(), 1);
    assert_eq!(log.errors[0].step, PHASE_INTEGRITY_CHECK);
    assert!(log.errors[0].error.contains("1 of 3"));

    assert_eq!(snapshot(&engine).await, before);
    assert!(executor.validator().check_data_integrity().await.unwrap().is_valid);
}

#[tokio::test]
async fn test_validation_is_idempotent() {
    let engine = store_at_v2(3).await;
    let mut card = Card::new("odd", json!({"name": "Odd"}));
    card.modified = Some("last tuesday".to_string());
    engine.put_card(&card).await.unwrap();

    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::new(collaborators(&engine, &marker), config());

    let first = executor.validate_migration(2, 4).await;
    let second = executor.validate_migration(2, 4).await;
    assert_eq!(first, second);
    assert!(first.is_valid);
    assert!(!first.warnings.is_empty());
}

#[tokio::test]
async fn test_concurrent_migration_is_rejected() {
    let engine = store_at_v2(2).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let mut registry = StepRegistry::with_builtin();
    registry.register(
        ADD_FINGERPRINT_INDEXES,
        GateStep {
            entered: entered.clone(),
            release: release.clone(),
        },
    );
    let executor = Arc::new(MigrationExecutor::with_registry(
        collaborators(&engine, &marker),
        config(),
        registry,
    ));

    let first = {
        let executor = executor.clone();
        tokio::spawn(async move { executor.perform_safe_migration(3).await })
    };
    entered.notified().await;

    let second = executor.perform_safe_migration(3).await;
    assert_eq!(
        second,
        MigrationOutcome::Failed {
            migration_id: None,
            error: "migration already in progress".to_string(),
            rollback_completed: false,
        }
    );

    release.notify_one();
    let first = first.await.unwrap();
    assert!(first.is_success(), "{:?}", first);
    assert_eq!(executor.history().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_log_table_does_not_affect_outcome() {
    let engine = store_at_v2(3).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let mut collaborators = collaborators(&engine, &marker);
    collaborators.logs = Arc::new(NoLogTable);
    let executor = MigrationExecutor::new(collaborators, config());

    let outcome = executor.perform_safe_migration(3).await;
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(marker.get(MARKER_KEY).await.unwrap().as_deref(), Some("3"));
    assert!(executor.history().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restore_failure_is_reported() {
    let engine = store_at_v2(3).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let mut collaborators = collaborators(&engine, &marker).with_backfiller(Arc::new(FailingBackfiller));
    collaborators.records = Arc::new(NoRestoreStore {
        inner: engine.clone(),
    });
    let executor = MigrationExecutor::new(collaborators, config());

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Failed {
        error,
        rollback_completed,
        ..
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(!rollback_completed);
    assert!(error.contains("backfill exploded"));
    assert!(error.contains("read-only"));

    let log = only_log(&executor).await;
    assert_eq!(log.status, MigrationLogStatus::Rollback);
    let steps: Vec<_> = log.errors.iter().map(|e| e.step.as_str()).collect();
    assert_eq!(steps, vec![GENERATE_MISSING_FINGERPRINTS, PHASE_RESTORE_BACKUP]);
}

#[tokio::test]
async fn test_marker_failure_rolls_back() {
    let engine = store_at_v2(2).await;
    let before = snapshot(&engine).await;
    let marker = Arc::new(ReadOnlyMarker {
        written: AtomicBool::new(false),
    });
    let mut collaborators = Collaborators::from_engine(engine.clone(), marker.clone());
    collaborators.quota = Arc::new(StaticQuotaEstimator::new(0, 512 * BYTES_PER_MB));
    let executor = MigrationExecutor::new(collaborators, config());

    let outcome = executor.perform_safe_migration(3).await;
    assert!(matches!(
        outcome,
        MigrationOutcome::Failed {
            rollback_completed: true,
            ..
        }
    ));
    assert!(marker.written.load(Ordering::SeqCst));
    assert_eq!(snapshot(&engine).await, before);
}

#[tokio::test]
async fn test_degraded_mode_is_reported() {
    let engine = store_at_v2(3).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let mut collaborators = collaborators(&engine, &marker).without_backfiller();
    collaborators.quota = Arc::new(StaticQuotaEstimator::unavailable());
    let executor = MigrationExecutor::new(collaborators, config());

    let validation = executor.validate_migration(2, 3).await;
    assert_eq!(validation.degraded, vec![Degradation::QuotaUnavailable]);

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Completed {
        processed_cards,
        degraded,
        ..
    } = outcome
    else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(processed_cards, 0);
    assert_eq!(
        degraded,
        vec![
            Degradation::QuotaUnavailable,
            Degradation::FingerprintBackfillUnavailable
        ]
    );
    assert!(engine.list_cards().await.unwrap().iter().all(|c| c.fingerprint.is_none()));
}

#[tokio::test]
async fn test_full_upgrade_and_retention() {
    let engine = store_at_v2(0).await;
    engine.clear_tables().await.unwrap();
    for i in 0..3 {
        engine
            .put_card(&Card::new(format!("c{}", i), json!({"name": format!("C{}", i)})))
            .await
            .unwrap();
    }
    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::new(
        collaborators(&engine, &marker),
        config().with_backup_retention(1),
    );

    let outcome = executor.perform_safe_migration(4).await;
    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(marker.get(MARKER_KEY).await.unwrap().as_deref(), Some("4"));
    assert!(executor.validator().validate_indexes(4).await.unwrap().is_valid);

    // Already at the target: nothing further is supported.
    let again = executor.perform_safe_migration(4).await;
    assert!(!again.is_success());

    assert_eq!(executor.backups().list().await.unwrap().len(), 1);
    let log = executor.history().await.unwrap().remove(0);
    assert_eq!(log.status, MigrationLogStatus::Completed);
    assert_eq!(log.migration_version, 4);
    assert_eq!(log.from_version, 2);
}

#[tokio::test]
async fn test_unknown_step_rolls_back() {
    let engine = store_at_v2(1).await;
    let marker = Arc::new(MemoryVersionMarker::new());
    let executor = MigrationExecutor::with_registry(
        collaborators(&engine, &marker),
        config(),
        StepRegistry::new(),
    );

    let outcome = executor.perform_safe_migration(3).await;
    let MigrationOutcome::Failed {
        error,
        rollback_completed,
        ..
    } = outcome
    else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(rollback_completed);
    assert!(error.contains(ADD_FINGERPRINT_INDEXES));
}

#[tokio::test]
async fn test_marker_persists_across_reopen() {
    let data = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();
    {
        let engine = Arc::new(StorageEngine::open(StorageConfig::new(data.path())).unwrap());
        engine
            .put_card(&Card::new("a", json!({"name": "Ada"})))
            .await
            .unwrap();
        let marker = Arc::new(cardvault_core::FileVersionMarker::new(markers.path()));
        let executor = MigrationExecutor::new(Collaborators::from_engine(engine.clone(), marker), EngineConfig::default());
        assert_eq!(executor.initialize().await.unwrap(), 1);
        let outcome = executor.perform_safe_migration(2).await;
        assert!(outcome.is_success(), "{:?}", outcome);
        engine.flush().await.unwrap();
    }

    let engine = Arc::new(StorageEngine::open(StorageConfig::new(data.path())).unwrap());
    let marker = Arc::new(cardvault_core::FileVersionMarker::new(markers.path()));
    let executor = MigrationExecutor::new(Collaborators::from_engine(engine, marker), EngineConfig::default());
    assert_eq!(executor.current_version().await.unwrap(), 2);
    assert_eq!(executor.history().await.unwrap().len(), 1);
    let stored: Value = serde_json::to_value(&executor.history().await.unwrap()[0]).unwrap();
    assert_eq!(stored["status"], "completed");
}
