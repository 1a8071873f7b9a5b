//! Fingerprint backfill for cards created before fingerprints existed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::storage::{Card, RecordStore, FINGERPRINT_PREFIX};

/// Hex digits kept from the content digest.
const FINGERPRINT_DIGITS: usize = 32;

/// Payload fields that identify a contact.
const IDENTITY_FIELDS: [&str; 4] = ["name", "email", "phone", "organization"];

/// Outcome of a backfill run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    /// Cards that received a fingerprint.
    pub processed_count: u64,
    /// Cards scanned.
    pub total_cards: u64,
}

/// Populates missing card fingerprints.
#[async_trait]
pub trait FingerprintBackfiller: Send + Sync {
    /// Fingerprint every card that lacks one.
    async fn backfill_fingerprints(&self) -> Result<BackfillReport, Error>;
}

/// Configuration for fingerprint backfill.
#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Number of cards written between yields.
    pub batch_size: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { batch_size: 500 }
    }
}

/// Derives fingerprints from normalized contact fields.
pub struct ContentFingerprinter {
    store: Arc<dyn RecordStore>,
    config: BackfillConfig,
}

impl ContentFingerprinter {
    /// Create a fingerprinter with default batching.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self::with_config(store, BackfillConfig::default())
    }

    /// Create a fingerprinter with explicit batching.
    pub fn with_config(store: Arc<dyn RecordStore>, config: BackfillConfig) -> Self {
        Self { store, config }
    }

    /// Fingerprint of a card payload: `fp_` followed by 32 hex digits.
    pub fn fingerprint(data: &Value) -> String {
        let mut material = String::new();
        for field in IDENTITY_FIELDS {
            let raw = data.get(field).and_then(Value::as_str).unwrap_or_default();
            material.push_str(&normalize(field, raw));
            material.push('\n');
        }
        let digest = blake3::hash(material.as_bytes()).to_hex();
        format!("{}{}", FINGERPRINT_PREFIX, &digest.as_str()[..FINGERPRINT_DIGITS])
    }
}

fn normalize(field: &str, raw: &str) -> String {
    match field {
        "phone" => raw.chars().filter(|c| c.is_ascii_digit()).collect(),
        _ => raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase(),
    }
}

#[async_trait]
impl FingerprintBackfiller for ContentFingerprinter {
    async fn backfill_fingerprints(&self) -> Result<BackfillReport, Error> {
        let cards = self.store.list_cards().await?;
        let mut report = BackfillReport {
            total_cards: cards.len() as u64,
            ..Default::default()
        };

        let pending: Vec<Card> = cards
            .into_iter()
            .filter(|card| card.fingerprint.is_none() && card.data.is_some())
            .collect();

        for batch in pending.chunks(self.config.batch_size.max(1)) {
            for card in batch {
                let Some(data) = card.data.as_ref() else {
                    continue;
                };
                let updated = card.clone().with_fingerprint(Self::fingerprint(data));
                self.store.put_card(&updated).await?;
                report.processed_count += 1;
            }
            tracing::debug!(
                processed = report.processed_count,
                total = report.total_cards,
                "fingerprint batch written"
            );
            tokio::task::yield_now().await;
        }

        tracing::info!(
            processed = report.processed_count,
            total = report.total_cards,
            "fingerprint backfill finished"
        );
        Ok(report)
    }
}
