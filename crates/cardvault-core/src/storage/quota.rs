//! Storage quota estimation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Bytes per megabyte used in space reports.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Current usage and quota reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEstimate {
    /// Bytes in use.
    pub usage_bytes: u64,
    /// Total bytes available to this store.
    pub quota_bytes: u64,
}

impl StorageEstimate {
    /// Remaining headroom in whole megabytes.
    pub fn available_mb(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.usage_bytes) / BYTES_PER_MB
    }
}

/// Host quota introspection.
#[async_trait]
pub trait QuotaEstimator: Send + Sync {
    /// Current estimate, or `None` when the host cannot report quota.
    async fn estimate(&self) -> Result<Option<StorageEstimate>, Error>;
}

/// Estimator backed by sled's on-disk size and a configured quota.
pub struct SledQuotaEstimator {
    db: sled::Db,
    quota_bytes: Option<u64>,
}

impl SledQuotaEstimator {
    /// Create an estimator. A `None` quota reports no estimate.
    pub fn new(db: sled::Db, quota_bytes: Option<u64>) -> Self {
        Self { db, quota_bytes }
    }
}

#[async_trait]
impl QuotaEstimator for SledQuotaEstimator {
    async fn estimate(&self) -> Result<Option<StorageEstimate>, Error> {
        let Some(quota_bytes) = self.quota_bytes else {
            return Ok(None);
        };
        let usage_bytes = self.db.size_on_disk()?;
        Ok(Some(StorageEstimate {
            usage_bytes,
            quota_bytes,
        }))
    }
}

/// Estimator returning a fixed answer.
#[derive(Debug, Clone, Default)]
pub struct StaticQuotaEstimator {
    estimate: Option<StorageEstimate>,
}

impl StaticQuotaEstimator {
    /// Report the given usage and quota.
    pub fn new(usage_bytes: u64, quota_bytes: u64) -> Self {
        Self {
            estimate: Some(StorageEstimate {
                usage_bytes,
                quota_bytes,
            }),
        }
    }

    /// Report that quota introspection is unavailable.
    pub fn unavailable() -> Self {
        Self { estimate: None }
    }
}

#[async_trait]
impl QuotaEstimator for StaticQuotaEstimator {
    async fn estimate(&self) -> Result<Option<StorageEstimate>, Error> {
        Ok(self.estimate)
    }
}
