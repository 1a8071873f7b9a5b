//! Output formatting for command results.

use std::fmt::Write as _;

use clap::ValueEnum;
use serde::Serialize;

use cardvault_core::migration::{Backup, MigrationLog};
use cardvault_core::{IntegrityReport, MigrationOutcome, ValidationResult};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// A command result that can be shown as text or JSON.
pub trait Render: Serialize {
    /// Human-readable rendering.
    fn render_text(&self) -> String;
}

/// Render a result in the requested format.
pub fn render<T: Render>(value: &T, format: OutputFormat) -> Result<String, serde_json::Error> {
    match format {
        OutputFormat::Text => Ok(value.render_text()),
        OutputFormat::Json => serde_json::to_string_pretty(value),
    }
}

fn push_list(out: &mut String, title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{}:", title);
    for item in items {
        let _ = writeln!(out, "  - {}", item);
    }
}

/// Store status summary.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub current_version: u32,
    pub latest_version: Option<u32>,
    pub cards: usize,
    pub backups: usize,
    pub last_migration: Option<MigrationLog>,
}

impl Render for StatusReport {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "schema version: {}", self.current_version);
        if let Some(latest) = self.latest_version {
            let _ = writeln!(out, "latest version: {}", latest);
        }
        let _ = writeln!(out, "cards:          {}", self.cards);
        let _ = writeln!(out, "backups:        {}", self.backups);
        match &self.last_migration {
            Some(log) => {
                let _ = writeln!(
                    out,
                    "last migration: {} ({} -> {}, {})",
                    log.id, log.from_version, log.migration_version, log.status
                );
            }
            None => {
                let _ = writeln!(out, "last migration: none");
            }
        }
        out.trim_end().to_string()
    }
}

impl Render for ValidationResult {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "valid: {}", if self.is_valid { "yes" } else { "no" });
        push_list(&mut out, "errors", &self.errors);
        push_list(&mut out, "warnings", &self.warnings);
        push_list(&mut out, "affected stores", &self.affected_stores);
        push_list(&mut out, "required actions", &self.required_actions);
        let degraded: Vec<String> = self.degraded.iter().map(|d| d.to_string()).collect();
        push_list(&mut out, "degraded", &degraded);
        out.trim_end().to_string()
    }
}

impl Render for IntegrityReport {
    fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} cards scanned, {} corrupted ({})",
            self.total_cards,
            self.corrupted_cards,
            if self.is_valid { "ok" } else { "invalid" }
        );
        let issues: Vec<String> = self.issues.iter().map(|i| i.message.clone()).collect();
        push_list(&mut out, "issues", &issues);
        out.trim_end().to_string()
    }
}

impl Render for MigrationOutcome {
    fn render_text(&self) -> String {
        match self {
            MigrationOutcome::Completed {
                migration_id,
                from_version,
                to_version,
                processed_cards,
                duration_ms,
                degraded,
            } => {
                let mut out = format!(
                    "migration {} completed: {} -> {}, {} cards processed in {} ms",
                    migration_id, from_version, to_version, processed_cards, duration_ms
                );
                if !degraded.is_empty() {
                    let flags: Vec<String> = degraded.iter().map(|d| d.to_string()).collect();
                    let _ = write!(out, "\ndegraded: {}", flags.join(", "));
                }
                out
            }
            MigrationOutcome::Failed {
                migration_id,
                error,
                rollback_completed,
            } => format!(
                "migration {} failed: {}\nrollback completed: {}",
                migration_id.as_deref().unwrap_or("<not started>"),
                error,
                rollback_completed
            ),
        }
    }
}

/// Backup listing entry; card payloads are omitted.
#[derive(Debug, Serialize)]
pub struct BackupSummary {
    pub id: String,
    pub timestamp: String,
    pub db_version: u32,
    pub cards: usize,
    pub versions: usize,
    pub checksum: String,
}

impl From<&Backup> for BackupSummary {
    fn from(backup: &Backup) -> Self {
        Self {
            id: backup.id.clone(),
            timestamp: backup.timestamp.clone(),
            db_version: backup.db_version,
            cards: backup.cards.len(),
            versions: backup.versions.len(),
            checksum: backup.checksum.clone(),
        }
    }
}

/// Backup listing, with the number pruned if pruning ran.
#[derive(Debug, Serialize)]
pub struct BackupListing {
    pub pruned: Option<usize>,
    pub backups: Vec<BackupSummary>,
}

impl Render for BackupListing {
    fn render_text(&self) -> String {
        let mut out = String::new();
        if let Some(pruned) = self.pruned {
            let _ = writeln!(out, "pruned {} backup(s)", pruned);
        }
        if self.backups.is_empty() {
            let _ = writeln!(out, "no backups");
        }
        for b in &self.backups {
            let _ = writeln!(
                out,
                "{}  v{}  {} cards  {} versions  {}",
                b.id, b.db_version, b.cards, b.versions, b.timestamp
            );
        }
        out.trim_end().to_string()
    }
}

/// Migration history.
#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct LogListing(pub Vec<MigrationLog>);

impl Render for LogListing {
    fn render_text(&self) -> String {
        if self.0.is_empty() {
            return "no migrations recorded".to_string();
        }
        let mut out = String::new();
        for log in &self.0 {
            let _ = writeln!(
                out,
                "{}  {} -> {}  {}  processed {}/{}  started {}",
                log.id,
                log.from_version,
                log.migration_version,
                log.status,
                log.processed_cards,
                log.affected_cards,
                log.start_time
            );
            for err in &log.errors {
                let _ = writeln!(out, "    [{}] {}", err.step, err.error);
            }
        }
        out.trim_end().to_string()
    }
}

/// Result of an import.
#[derive(Debug, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub total_cards: usize,
}

impl Render for ImportReport {
    fn render_text(&self) -> String {
        format!("imported {} card(s), {} in store", self.imported, self.total_cards)
    }
}
