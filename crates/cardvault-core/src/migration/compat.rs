//! Version compatibility: which paths are supported, which indexes each
//! version requires, and which steps a path implies.
//!
//! Everything here is table-driven and free of I/O. The index table is
//! append-only: a version may add requirements but never drop one that a
//! lower version declared.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::storage::{CARDS_TABLE, MIGRATION_LOG_TABLE, VERSIONS_TABLE};

/// Schema version tag.
pub type SchemaVersion = u32;

/// Table name -> index names.
pub type IndexMap = BTreeMap<String, Vec<String>>;

/// Step creating the version-history indexes.
pub const ADD_VERSION_HISTORY_INDEXES: &str = "add_version_history_indexes";

/// Step creating the fingerprint indexes.
pub const ADD_FINGERPRINT_INDEXES: &str = "add_fingerprint_indexes";

/// Step backfilling missing fingerprints.
pub const GENERATE_MISSING_FINGERPRINTS: &str = "generate_missing_fingerprints";

/// Step creating the migration log table and its indexes.
pub const CREATE_MIGRATION_LOG_TABLE: &str = "create_migration_log_table";

/// `(introduced in, table, indexes)`.
const INDEX_REQUIREMENTS: &[(SchemaVersion, &str, &[&str])] = &[
    (1, CARDS_TABLE, &["created", "modified"]),
    (2, VERSIONS_TABLE, &["card_id", "timestamp"]),
    (3, CARDS_TABLE, &["fingerprint"]),
    (3, VERSIONS_TABLE, &["fingerprint"]),
    (4, MIGRATION_LOG_TABLE, &["status", "start_time"]),
];

/// `(version reached, step name, description)`, in execution order.
const STEP_TABLE: &[(SchemaVersion, &str, &str)] = &[
    (
        2,
        ADD_VERSION_HISTORY_INDEXES,
        "index version history by card and timestamp",
    ),
    (
        3,
        ADD_FINGERPRINT_INDEXES,
        "add fingerprint indexes to cards and versions",
    ),
    (
        3,
        GENERATE_MISSING_FINGERPRINTS,
        "backfill fingerprints for cards that lack one",
    ),
    (
        4,
        CREATE_MIGRATION_LOG_TABLE,
        "create the migration log table with status and start time indexes",
    ),
];

/// Versions supported out of the box.
pub const DEFAULT_SUPPORTED_VERSIONS: [SchemaVersion; 4] = [1, 2, 3, 4];

/// A declarative migration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStep {
    /// Unique symbolic name, used to look up the handler.
    pub name: String,
    /// Human-readable description.
    pub description: String,
}

impl MigrationStep {
    /// Create a step.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Decides which migration paths are supported and what they imply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCompatibilityChecker {
    supported: BTreeSet<SchemaVersion>,
}

impl Default for VersionCompatibilityChecker {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPORTED_VERSIONS)
    }
}

impl VersionCompatibilityChecker {
    /// Create a checker for the given supported versions.
    pub fn new(supported: impl IntoIterator<Item = SchemaVersion>) -> Self {
        Self {
            supported: supported.into_iter().collect(),
        }
    }

    /// The supported version set.
    pub fn supported_versions(&self) -> &BTreeSet<SchemaVersion> {
        &self.supported
    }

    /// Highest supported version.
    pub fn latest(&self) -> Option<SchemaVersion> {
        self.supported.iter().next_back().copied()
    }

    /// True iff both versions are supported and `to > from`.
    pub fn is_supported(&self, from: SchemaVersion, to: SchemaVersion) -> bool {
        to > from && self.supported.contains(&from) && self.supported.contains(&to)
    }

    /// Every index that must exist at `version`.
    pub fn required_indexes(&self, version: SchemaVersion) -> IndexMap {
        let mut map = IndexMap::new();
        for (introduced, table, indexes) in INDEX_REQUIREMENTS {
            if *introduced <= version {
                let entry = map.entry(table.to_string()).or_default();
                entry.extend(indexes.iter().map(|i| i.to_string()));
            }
        }
        map
    }

    /// Indexes first required by exactly `version`.
    pub fn indexes_introduced_at(&self, version: SchemaVersion) -> IndexMap {
        let mut map = IndexMap::new();
        for (introduced, table, indexes) in INDEX_REQUIREMENTS {
            if *introduced == version {
                let entry = map.entry(table.to_string()).or_default();
                entry.extend(indexes.iter().map(|i| i.to_string()));
            }
        }
        map
    }

    /// Indexes required at `to` but not at `from`.
    pub fn indexes_added(&self, from: SchemaVersion, to: SchemaVersion) -> IndexMap {
        let before = self.required_indexes(from);
        let mut added = IndexMap::new();
        for (table, indexes) in self.required_indexes(to) {
            let existing = before.get(&table);
            let new: Vec<String> = indexes
                .into_iter()
                .filter(|i| existing.map_or(true, |e| !e.contains(i)))
                .collect();
            if !new.is_empty() {
                added.insert(table, new);
            }
        }
        added
    }

    /// Ordered steps for a path. Unsupported paths yield no steps.
    pub fn steps_for(&self, from: SchemaVersion, to: SchemaVersion) -> Vec<MigrationStep> {
        if !self.is_supported(from, to) {
            return Vec::new();
        }
        STEP_TABLE
            .iter()
            .filter(|(reached, _, _)| *reached > from && *reached <= to)
            .map(|(_, name, description)| MigrationStep::new(*name, *description))
            .collect()
    }
}
