//! Integrity validation: record structure, checksums, indexes, and space.
//!
//! The validator is read-only against the store. Its pre-migration verdict
//! is asymmetric: only an unsupported path or indexes the live
//! store should already have block a migration. Row-level problems and low
//! storage are surfaced as warnings.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::compat::{IndexMap, SchemaVersion, VersionCompatibilityChecker};
use super::error::MigrationError;
use super::report::{
    flatten, Degradation, IndexValidationResult, IntegrityIssue, IntegrityReport, IssueKind,
    StorageSpaceReport, ValidationResult,
};
use crate::storage::{is_valid_fingerprint, Card, QuotaEstimator, RecordStore, MUTABLE_TABLES};

/// Default storage headroom, in megabytes.
pub const DEFAULT_REQUIRED_FREE_MB: u64 = 10;

/// Inspects live records, indexes, and storage headroom.
pub struct IntegrityValidator {
    store: Arc<dyn RecordStore>,
    quota: Arc<dyn QuotaEstimator>,
    checker: VersionCompatibilityChecker,
    required_free_mb: u64,
}

impl IntegrityValidator {
    /// Create a validator.
    pub fn new(
        store: Arc<dyn RecordStore>,
        quota: Arc<dyn QuotaEstimator>,
        checker: VersionCompatibilityChecker,
    ) -> Self {
        Self {
            store,
            quota,
            checker,
            required_free_mb: DEFAULT_REQUIRED_FREE_MB,
        }
    }

    /// Set the required storage headroom.
    pub fn with_required_free_mb(mut self, mb: u64) -> Self {
        self.required_free_mb = mb;
        self
    }

    /// Scan every card for structural and checksum problems.
    pub async fn check_data_integrity(&self) -> Result<IntegrityReport, MigrationError> {
        let cards = self.store.list_cards().await?;
        let mut report = IntegrityReport {
            total_cards: cards.len(),
            ..Default::default()
        };

        for card in &cards {
            let issues = self.inspect_card(card);
            if issues.iter().any(|i| i.kind.is_corruption()) {
                report.corrupted_cards += 1;
            }
            report.issues.extend(issues);
        }
        report.is_valid = report.corrupted_cards == 0;

        tracing::debug!(
            total_cards = report.total_cards,
            corrupted_cards = report.corrupted_cards,
            issues = report.issues.len(),
            "integrity scan finished"
        );
        Ok(report)
    }

    fn inspect_card(&self, card: &Card) -> Vec<IntegrityIssue> {
        let card_id = Some(card.id.clone()).filter(|id| !id.is_empty());
        let issue = |kind: IssueKind, message: String| IntegrityIssue {
            card_id: card_id.clone(),
            kind,
            message,
        };
        let label = card_id.as_deref().unwrap_or("<no id>");
        let mut issues = Vec::new();

        if card_id.is_none() {
            issues.push(issue(IssueKind::MissingField, "card is missing id".to_string()));
        }

        match card.data.as_ref().filter(|d| !d.is_null()) {
            None => issues.push(issue(
                IssueKind::MissingField,
                format!("card {} is missing data", label),
            )),
            Some(data) => {
                let actual = self.store.calculate_checksum(data);
                match card.checksum.as_deref() {
                    Some(stored) if stored == actual => {}
                    Some(stored) => issues.push(issue(
                        IssueKind::ChecksumMismatch,
                        format!("card {} checksum mismatch: stored {}, computed {}", label, stored, actual),
                    )),
                    None => issues.push(issue(
                        IssueKind::ChecksumMismatch,
                        format!("card {} has no checksum", label),
                    )),
                }
            }
        }

        match card.created.as_deref() {
            None => issues.push(issue(
                IssueKind::MissingField,
                format!("card {} is missing created", label),
            )),
            Some(created) if !parses_as_date(created) => issues.push(issue(
                IssueKind::InvalidDate,
                format!("card {} has unparseable created date {:?}", label, created),
            )),
            Some(_) => {}
        }

        if let Some(modified) = card.modified.as_deref() {
            if !parses_as_date(modified) {
                issues.push(issue(
                    IssueKind::InvalidDate,
                    format!("card {} has unparseable modified date {:?}", label, modified),
                ));
            }
        }

        if let Some(fingerprint) = card.fingerprint.as_deref() {
            if !is_valid_fingerprint(fingerprint) {
                issues.push(issue(
                    IssueKind::InvalidFingerprint,
                    format!("card {} has malformed fingerprint {:?}", label, fingerprint),
                ));
            }
        }

        issues
    }

    /// Compare the indexes required at `target` with those present.
    pub async fn validate_indexes(
        &self,
        target: SchemaVersion,
    ) -> Result<IndexValidationResult, MigrationError> {
        let required = self.checker.required_indexes(target);
        let existing_tables: BTreeSet<String> =
            self.store.table_names().await?.into_iter().collect();

        let mut tables: BTreeSet<String> = required.keys().cloned().collect();
        tables.extend(MUTABLE_TABLES.iter().map(|t| t.to_string()));

        let mut result = IndexValidationResult {
            is_valid: true,
            ..Default::default()
        };

        for table in tables {
            let wanted = required.get(&table).cloned().unwrap_or_default();
            let actual = if existing_tables.contains(&table) {
                self.store.index_names(&table).await?
            } else {
                Vec::new()
            };

            let missing: Vec<String> = wanted.iter().filter(|i| !actual.contains(i)).cloned().collect();
            let redundant: Vec<String> = actual.iter().filter(|i| !wanted.contains(i)).cloned().collect();

            if !missing.is_empty() {
                result.is_valid = false;
                result.missing.insert(table.clone(), missing);
            }
            if !redundant.is_empty() {
                result.redundant.insert(table, redundant);
            }
        }

        Ok(result)
    }

    /// Check storage headroom. Fails open when quota cannot be read.
    pub async fn check_storage_space(&self) -> StorageSpaceReport {
        let estimate = match self.quota.estimate().await {
            Ok(estimate) => estimate,
            Err(e) => {
                tracing::warn!(error = %e, "quota estimation failed, assuming sufficient space");
                None
            }
        };

        match estimate {
            Some(estimate) => {
                let available_mb = estimate.available_mb();
                StorageSpaceReport {
                    sufficient: available_mb >= self.required_free_mb,
                    available_mb: Some(available_mb),
                    required_mb: self.required_free_mb,
                    degraded: false,
                }
            }
            None => StorageSpaceReport {
                sufficient: true,
                available_mb: None,
                required_mb: self.required_free_mb,
                degraded: true,
            },
        }
    }

    /// Decide whether migrating `from -> to` may be attempted.
    pub async fn validate_migration(&self, from: SchemaVersion, to: SchemaVersion) -> ValidationResult {
        if !self.checker.is_supported(from, to) {
            return ValidationResult::invalid(format!(
                "unsupported migration path: {} -> {}",
                from, to
            ));
        }

        let mut result = ValidationResult {
            is_valid: true,
            ..Default::default()
        };

        match self.check_data_integrity().await {
            Ok(report) => {
                if report.corrupted_cards > 0 {
                    result.warnings.push(format!(
                        "{} of {} cards are corrupted",
                        report.corrupted_cards, report.total_cards
                    ));
                }
                result
                    .warnings
                    .extend(report.issues.into_iter().map(|issue| issue.message));
            }
            Err(e) => result.warnings.push(format!("integrity check failed: {}", e)),
        }

        // Indexes the plan will create are actions; anything else missing
        // is drift in the live store.
        let planned = self.checker.indexes_added(from, to);
        match self.validate_indexes(to).await {
            Ok(indexes) => {
                let (satisfiable, drift) = split_missing(&indexes.missing, &planned);
                if !drift.is_empty() {
                    result.is_valid = false;
                    result.errors.push(format!(
                        "missing indexes: {}",
                        flatten(&drift).join(", ")
                    ));
                }
                result.required_actions.extend(
                    flatten(&satisfiable)
                        .into_iter()
                        .map(|index| format!("create index {}", index)),
                );
                let redundant = indexes.redundant_list();
                if !redundant.is_empty() {
                    result
                        .warnings
                        .push(format!("redundant indexes: {}", redundant.join(", ")));
                }
            }
            Err(e) => {
                result.is_valid = false;
                result.errors.push(format!("index validation failed: {}", e));
            }
        }

        let space = self.check_storage_space().await;
        if space.degraded {
            result.degraded.push(Degradation::QuotaUnavailable);
            result
                .warnings
                .push("storage quota unavailable, assuming sufficient space".to_string());
        } else if !space.sufficient {
            result.warnings.push(format!(
                "low storage: {} MB available, {} MB recommended",
                space.available_mb.unwrap_or_default(),
                space.required_mb
            ));
        }

        let steps = self.checker.steps_for(from, to);
        result
            .required_actions
            .extend(steps.iter().map(|step| format!("run step {}", step.name)));

        let mut stores: BTreeSet<String> = planned.keys().cloned().collect();
        if !steps.is_empty() {
            stores.extend(MUTABLE_TABLES.iter().map(|t| t.to_string()));
        }
        result.affected_stores = stores.into_iter().collect();

        result
    }
}

fn parses_as_date(value: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(value).is_ok()
}

/// Split missing indexes into those the plan creates and the rest.
fn split_missing(missing: &IndexMap, planned: &IndexMap) -> (IndexMap, IndexMap) {
    let mut satisfiable = IndexMap::new();
    let mut drift = IndexMap::new();
    for (table, indexes) in missing {
        let plan = planned.get(table);
        for index in indexes {
            let target = if plan.is_some_and(|p| p.contains(index)) {
                &mut satisfiable
            } else {
                &mut drift
            };
            target.entry(table.clone()).or_insert_with(Vec::new).push(index.clone());
        }
    }
    (satisfiable, drift)
}
