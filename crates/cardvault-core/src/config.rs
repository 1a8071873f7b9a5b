//! Migration engine configuration.

use std::collections::BTreeSet;

use crate::migration::{SchemaVersion, DEFAULT_REQUIRED_FREE_MB, DEFAULT_SUPPORTED_VERSIONS};

/// Key the current schema version is stored under.
pub const DEFAULT_VERSION_MARKER_KEY: &str = "cardvault_db_version";

/// Configuration for the migration executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Schema versions the engine can migrate between.
    pub supported_versions: BTreeSet<SchemaVersion>,
    /// Version assumed when no marker has been written yet.
    pub initial_version: SchemaVersion,
    /// Storage headroom below which validation warns, in megabytes.
    pub required_free_mb: u64,
    /// Version marker key.
    pub version_marker_key: String,
    /// Number of backups kept after a completed migration. `None` keeps all.
    pub backup_retention: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.into_iter().collect(),
            initial_version: 1,
            required_free_mb: DEFAULT_REQUIRED_FREE_MB,
            version_marker_key: DEFAULT_VERSION_MARKER_KEY.to_string(),
            backup_retention: None,
        }
    }
}

impl EngineConfig {
    /// Set the supported versions.
    pub fn with_supported_versions(mut self, versions: impl IntoIterator<Item = SchemaVersion>) -> Self {
        self.supported_versions = versions.into_iter().collect();
        self
    }

    /// Set the version assumed for an unmarked store.
    pub fn with_initial_version(mut self, version: SchemaVersion) -> Self {
        self.initial_version = version;
        self
    }

    /// Set the storage headroom.
    pub fn with_required_free_mb(mut self, mb: u64) -> Self {
        self.required_free_mb = mb;
        self
    }

    /// Set the version marker key.
    pub fn with_version_marker_key(mut self, key: impl Into<String>) -> Self {
        self.version_marker_key = key.into();
        self
    }

    /// Keep only the newest `keep` backups after each completed migration.
    pub fn with_backup_retention(mut self, keep: usize) -> Self {
        self.backup_retention = Some(keep);
        self
    }
}
