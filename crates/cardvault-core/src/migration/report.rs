//! Results produced by the integrity validator.

use serde::{Deserialize, Serialize};

use super::compat::IndexMap;

/// A capability the engine could not use and fell back around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    /// The host could not report storage quota; space was assumed sufficient.
    QuotaUnavailable,
    /// No fingerprint backfiller was configured; the backfill step was skipped.
    FingerprintBackfillUnavailable,
}

impl std::fmt::Display for Degradation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Degradation::QuotaUnavailable => write!(f, "quota unavailable"),
            Degradation::FingerprintBackfillUnavailable => {
                write!(f, "fingerprint backfill unavailable")
            }
        }
    }
}

/// Kind of integrity problem found on a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A required field (`id`, `data`, `created`) is absent.
    MissingField,
    /// The stored checksum does not match the payload.
    ChecksumMismatch,
    /// The fingerprint does not carry the expected prefix and format.
    InvalidFingerprint,
    /// A timestamp does not parse.
    InvalidDate,
}

impl IssueKind {
    /// Whether this kind marks the card as corrupted.
    ///
    /// Date format problems are soft: reported, but not corruption.
    pub fn is_corruption(&self) -> bool {
        !matches!(self, IssueKind::InvalidDate)
    }
}

/// One problem found on one card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    /// Card id, if the card has one.
    pub card_id: Option<String>,
    /// Kind of problem.
    pub kind: IssueKind,
    /// Human-readable description.
    pub message: String,
}

/// Outcome of a row-level integrity scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    /// True when no card is corrupted.
    pub is_valid: bool,
    /// Every problem found, hard and soft.
    pub issues: Vec<IntegrityIssue>,
    /// Number of cards scanned.
    pub total_cards: usize,
    /// Number of cards with at least one hard problem.
    pub corrupted_cards: usize,
}

/// Declared-versus-actual index comparison.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndexValidationResult {
    /// False if any required index is missing.
    pub is_valid: bool,
    /// Required indexes not present, per table.
    pub missing: IndexMap,
    /// Present indexes no version requires, per table. Never blocking.
    pub redundant: IndexMap,
}

impl IndexValidationResult {
    /// Missing indexes as `table.index` strings.
    pub fn missing_list(&self) -> Vec<String> {
        flatten(&self.missing)
    }

    /// Redundant indexes as `table.index` strings.
    pub fn redundant_list(&self) -> Vec<String> {
        flatten(&self.redundant)
    }
}

pub(crate) fn flatten(map: &IndexMap) -> Vec<String> {
    map.iter()
        .flat_map(|(table, indexes)| indexes.iter().map(move |i| format!("{}.{}", table, i)))
        .collect()
}

/// Storage headroom check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpaceReport {
    /// Whether there is enough room. True when unknown.
    pub sufficient: bool,
    /// Available megabytes, if known.
    pub available_mb: Option<u64>,
    /// Megabytes of headroom the engine wants.
    pub required_mb: u64,
    /// True when quota could not be introspected.
    pub degraded: bool,
}

/// Pre-migration validation outcome.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    /// False only for an unsupported path or missing indexes.
    pub is_valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking problems.
    pub warnings: Vec<String>,
    /// Tables the migration will touch.
    pub affected_stores: Vec<String>,
    /// Work the migration will perform.
    pub required_actions: Vec<String>,
    /// Capabilities that fell back to fail-open behavior.
    pub degraded: Vec<Degradation>,
}

impl ValidationResult {
    /// An invalid result carrying a single error.
    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_severity() {
        assert!(IssueKind::MissingField.is_corruption());
        assert!(IssueKind::ChecksumMismatch.is_corruption());
        assert!(IssueKind::InvalidFingerprint.is_corruption());
        assert!(!IssueKind::InvalidDate.is_corruption());
    }

    #[test]
    fn test_flatten_index_map() {
        let mut missing = IndexMap::new();
        missing.insert("cards".into(), vec!["fingerprint".into()]);
        missing.insert("versions".into(), vec!["card_id".into(), "fingerprint".into()]);
        let result = IndexValidationResult {
            is_valid: false,
            missing,
            redundant: IndexMap::new(),
        };
        assert_eq!(
            result.missing_list(),
            vec!["cards.fingerprint", "versions.card_id", "versions.fingerprint"]
        );
        assert!(result.redundant_list().is_empty());
    }

    #[test]
    fn test_invalid_result() {
        let result = ValidationResult::invalid("nope");
        assert!(!result.is_valid);
        assert_eq!(result.errors, vec!["nope"]);
        assert!(result.warnings.is_empty());
    }
}
