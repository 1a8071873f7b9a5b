//! Step handlers and the registry that dispatches steps by name.
//!
//! Adding a step means registering a handler; the executor never matches
//! on step names itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::backfill::FingerprintBackfiller;
use super::compat::{
    SchemaVersion, VersionCompatibilityChecker, ADD_FINGERPRINT_INDEXES,
    ADD_VERSION_HISTORY_INDEXES, CREATE_MIGRATION_LOG_TABLE, GENERATE_MISSING_FINGERPRINTS,
};
use super::error::MigrationError;
use super::report::Degradation;
use crate::storage::RecordStore;

/// What a step handler may touch.
pub struct StepContext {
    /// Live record store.
    pub store: Arc<dyn RecordStore>,
    /// Version table.
    pub checker: VersionCompatibilityChecker,
    /// Optional fingerprint collaborator.
    pub backfiller: Option<Arc<dyn FingerprintBackfiller>>,
    /// Source schema version.
    pub from_version: SchemaVersion,
    /// Target schema version.
    pub to_version: SchemaVersion,
}

/// Result of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepReport {
    /// Cards processed, for steps that count.
    pub processed: Option<u64>,
    /// Capability the step had to skip.
    pub degraded: Option<Degradation>,
}

/// A named unit of migration work.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step.
    async fn run(&self, ctx: &StepContext) -> Result<StepReport, MigrationError>;
}

/// Step name -> handler.
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in step.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ADD_VERSION_HISTORY_INDEXES, IndexStep::new(2));
        registry.register(ADD_FINGERPRINT_INDEXES, IndexStep::new(3));
        registry.register(GENERATE_MISSING_FINGERPRINTS, GenerateFingerprintsStep);
        registry.register(CREATE_MIGRATION_LOG_TABLE, IndexStep::new(4));
        registry
    }

    /// Register or replace a handler.
    pub fn register(&mut self, name: impl Into<String>, handler: impl StepHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered step names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Creates the tables and indexes a version introduces, then checks them.
pub struct IndexStep {
    version: SchemaVersion,
}

impl IndexStep {
    /// Step for the indexes first required at `version`.
    pub fn new(version: SchemaVersion) -> Self {
        Self { version }
    }
}

#[async_trait]
impl StepHandler for IndexStep {
    async fn run(&self, ctx: &StepContext) -> Result<StepReport, MigrationError> {
        let wanted = ctx.checker.indexes_introduced_at(self.version);

        for (table, indexes) in &wanted {
            ctx.store.create_table(table).await?;
            for index in indexes {
                ctx.store.create_index(table, index).await?;
            }
        }

        let mut missing = Vec::new();
        for (table, indexes) in &wanted {
            let present = ctx.store.index_names(table).await?;
            missing.extend(
                indexes
                    .iter()
                    .filter(|i| !present.contains(i))
                    .map(|i| format!("{}.{}", table, i)),
            );
        }
        if !missing.is_empty() {
            return Err(MigrationError::SchemaDrift { missing });
        }

        tracing::debug!(
            version = self.version,
            from_version = ctx.from_version,
            to_version = ctx.to_version,
            tables = wanted.len(),
            "indexes in place"
        );
        Ok(StepReport::default())
    }
}

/// Delegates to the fingerprint backfiller, or skips when there is none.
pub struct GenerateFingerprintsStep;

#[async_trait]
impl StepHandler for GenerateFingerprintsStep {
    async fn run(&self, ctx: &StepContext) -> Result<StepReport, MigrationError> {
        let Some(backfiller) = ctx.backfiller.as_ref() else {
            tracing::warn!(
                from_version = ctx.from_version,
                to_version = ctx.to_version,
                "no fingerprint backfiller configured, skipping backfill"
            );
            return Ok(StepReport {
                processed: None,
                degraded: Some(Degradation::FingerprintBackfillUnavailable),
            });
        };

        let report = backfiller
            .backfill_fingerprints()
            .await
            .map_err(|e| MigrationError::step_failed(GENERATE_MISSING_FINGERPRINTS, e))?;

        Ok(StepReport {
            processed: Some(report.processed_count),
            degraded: None,
        })
    }
}
