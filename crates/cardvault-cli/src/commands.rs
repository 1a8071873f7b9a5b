//! Subcommand implementations.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use cardvault_core::migration::{Collaborators, MigrationExecutor};
use cardvault_core::storage::key::generate_id;
use cardvault_core::storage::{compute_checksum, RecordStore, StaticQuotaEstimator, BYTES_PER_MB};
use cardvault_core::{
    Card, EngineConfig, FileVersionMarker, MigrationOutcome, StorageConfig, StorageEngine,
    VersionEntry,
};

use crate::error::Error;
use crate::formatter::{BackupListing, BackupSummary, ImportReport, LogListing, StatusReport};

/// An opened store plus the executor over it.
pub struct Context {
    pub engine: Arc<StorageEngine>,
    pub executor: MigrationExecutor,
}

/// Settings shared by every subcommand.
pub struct OpenOptions<'a> {
    pub data_path: &'a Path,
    pub marker_dir: &'a Path,
    pub quota_mb: Option<u64>,
    pub initial_version: u32,
    pub keep_backups: Option<usize>,
}

impl Context {
    /// Open the store and bring an unmarked store to the initial version.
    pub async fn open(options: OpenOptions<'_>) -> Result<Self, Error> {
        let mut storage = StorageConfig::new(options.data_path);
        if let Some(mb) = options.quota_mb {
            storage = storage.with_quota_bytes(mb * BYTES_PER_MB);
        }
        let engine = Arc::new(StorageEngine::open(storage)?);
        tracing::debug!(
            data_path = %options.data_path.display(),
            recovered = engine.was_recovered(),
            "store opened"
        );

        let marker = Arc::new(FileVersionMarker::new(options.marker_dir));
        let mut collaborators = Collaborators::from_engine(engine.clone(), marker);
        if options.quota_mb.is_none() {
            collaborators.quota = Arc::new(StaticQuotaEstimator::unavailable());
        }

        let mut config = EngineConfig::default().with_initial_version(options.initial_version);
        if let Some(keep) = options.keep_backups {
            config = config.with_backup_retention(keep);
        }

        let executor = MigrationExecutor::new(collaborators, config);
        executor.initialize().await?;
        Ok(Self { engine, executor })
    }

    /// Flush pending writes.
    pub async fn close(self) -> Result<(), Error> {
        self.engine.flush().await?;
        Ok(())
    }
}

pub async fn status(ctx: &Context) -> Result<StatusReport, Error> {
    let history = ctx.executor.history().await?;
    Ok(StatusReport {
        current_version: ctx.executor.current_version().await?,
        latest_version: ctx.executor.checker().latest(),
        cards: ctx.engine.card_count(),
        backups: ctx.executor.backups().list().await?.len(),
        last_migration: history.into_iter().last(),
    })
}

pub async fn validate(
    ctx: &Context,
    from: Option<u32>,
    to: Option<u32>,
) -> Result<cardvault_core::ValidationResult, Error> {
    let from = match from {
        Some(v) => v,
        None => ctx.executor.current_version().await?,
    };
    let to = resolve_target(ctx, to);
    Ok(ctx.executor.validate_migration(from, to).await)
}

pub async fn migrate(ctx: &Context, to: Option<u32>) -> MigrationOutcome {
    let to = resolve_target(ctx, to);
    ctx.executor.perform_safe_migration(to).await
}

fn resolve_target(ctx: &Context, to: Option<u32>) -> u32 {
    to.or_else(|| ctx.executor.checker().latest())
        .unwrap_or(ctx.executor.config().initial_version)
}

pub async fn integrity(ctx: &Context) -> Result<cardvault_core::IntegrityReport, Error> {
    Ok(ctx.executor.validator().check_data_integrity().await?)
}

pub async fn backups(ctx: &Context, prune: Option<usize>) -> Result<BackupListing, Error> {
    let pruned = match prune {
        Some(keep) => Some(ctx.executor.backups().prune(keep).await?),
        None => None,
    };
    let backups = ctx.executor.backups().list().await?;
    Ok(BackupListing {
        pruned,
        backups: backups.iter().map(BackupSummary::from).collect(),
    })
}

pub async fn logs(ctx: &Context) -> Result<LogListing, Error> {
    Ok(LogListing(ctx.executor.history().await?))
}

/// Import cards from a JSON array.
///
/// Each element is either a stored card (`{"id", "data", ...}`) or a bare
/// payload (`{"name", ...}`) that gets a generated id. Every imported card
/// also gets a first version history entry.
pub async fn import(ctx: &Context, file: &Path) -> Result<ImportReport, Error> {
    let content = tokio::fs::read_to_string(file).await?;
    let cards = parse_import(&content)?;

    for card in &cards {
        ctx.engine.put_card(card).await?;
        if let Some(data) = card.data.clone() {
            let entry = VersionEntry::new(format!("{}_v1", card.id), card.id.clone(), 1, data);
            ctx.engine.put_version(&entry).await?;
        }
    }

    tracing::info!(imported = cards.len(), file = %file.display(), "cards imported");
    Ok(ImportReport {
        imported: cards.len(),
        total_cards: ctx.engine.card_count(),
    })
}

fn parse_import(content: &str) -> Result<Vec<Card>, Error> {
    let value: Value = serde_json::from_str(content)?;
    let Value::Array(items) = value else {
        return Err(Error::InvalidImport("expected a JSON array".to_string()));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| -> Result<Card, Error> {
            if !item.is_object() {
                return Err(Error::InvalidImport(format!("element {} is not an object", i)));
            }
            if item.get("data").is_some() {
                let mut card: Card = serde_json::from_value(item)?;
                if card.id.is_empty() {
                    card.id = generate_id("card");
                }
                if card.checksum.is_none() {
                    card.checksum = card.data.as_ref().map(compute_checksum);
                }
                Ok(card)
            } else {
                if item.get("name").and_then(Value::as_str).is_none() {
                    return Err(Error::InvalidImport(format!("element {} has no name", i)));
                }
                Ok(Card::new(generate_id("card"), item))
            }
        })
        .collect()
}

/// Fail the process when a migration did not commit.
pub fn ensure_success(outcome: &MigrationOutcome) -> Result<(), Error> {
    match outcome {
        MigrationOutcome::Completed { .. } => Ok(()),
        MigrationOutcome::Failed { error, .. } => Err(Error::MigrationFailed(error.clone())),
    }
}
