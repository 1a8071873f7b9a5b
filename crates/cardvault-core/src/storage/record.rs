//! Stored record types: cards and their version history.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::key::now_rfc3339;

/// Prefix every fingerprint carries.
pub const FINGERPRINT_PREFIX: &str = "fp_";

/// Minimum number of hex digits after the fingerprint prefix.
pub const FINGERPRINT_MIN_DIGITS: usize = 8;

/// Compute the content checksum of a payload.
///
/// BLAKE3 over the compact JSON encoding. `serde_json::Map` keeps keys
/// sorted, so equal payloads always produce equal digests.
pub fn compute_checksum(payload: &Value) -> String {
    blake3::hash(payload.to_string().as_bytes()).to_hex().to_string()
}

/// Check that a fingerprint has the fixed prefix followed by lowercase hex.
pub fn is_valid_fingerprint(fingerprint: &str) -> bool {
    match fingerprint.strip_prefix(FINGERPRINT_PREFIX) {
        Some(digits) => {
            digits.len() >= FINGERPRINT_MIN_DIGITS
                && digits.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// A stored business card.
///
/// Fields are optional at the storage level so that malformed records can
/// still be loaded and reported by the integrity scan.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Card {
    /// Unique, immutable card id. Empty means missing.
    #[serde(default)]
    pub id: String,
    /// Opaque card payload, containing at least a `name`.
    #[serde(default)]
    pub data: Option<Value>,
    /// Creation time (RFC 3339).
    #[serde(default)]
    pub created: Option<String>,
    /// Last modification time (RFC 3339).
    #[serde(default)]
    pub modified: Option<String>,
    /// Hex digest of `data`.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Derived duplicate-correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl Card {
    /// Create a well-formed card stamped with the current time.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        let now = now_rfc3339();
        let checksum = compute_checksum(&data);
        Self {
            id: id.into(),
            data: Some(data),
            created: Some(now.clone()),
            modified: Some(now),
            checksum: Some(checksum),
            fingerprint: None,
        }
    }

    /// Set the fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// The card's display name, if present in the payload.
    pub fn name(&self) -> Option<&str> {
        self.data.as_ref()?.get("name")?.as_str()
    }

    /// Look up an indexable field value by index name.
    pub fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "id" => Some(self.id.clone()).filter(|id| !id.is_empty()),
            "created" => self.created.clone(),
            "modified" => self.modified.clone(),
            "fingerprint" => self.fingerprint.clone(),
            other => self
                .data
                .as_ref()
                .and_then(|d| d.get(other))
                .and_then(json_scalar),
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One entry of a card's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    /// Unique entry id.
    pub id: String,
    /// The card this entry belongs to.
    pub card_id: String,
    /// Sequential version number of the card.
    pub version: u32,
    /// Snapshot of the card payload at this version.
    pub data: Value,
    /// When this version was recorded (RFC 3339).
    pub timestamp: String,
    /// Hex digest of `data`.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Fingerprint of the card at this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl VersionEntry {
    /// Record a new version of a card.
    pub fn new(id: impl Into<String>, card_id: impl Into<String>, version: u32, data: Value) -> Self {
        let checksum = compute_checksum(&data);
        Self {
            id: id.into(),
            card_id: card_id.into(),
            version,
            data,
            timestamp: now_rfc3339(),
            checksum: Some(checksum),
            fingerprint: None,
        }
    }

    /// Look up an indexable field value by index name.
    pub fn index_value(&self, index: &str) -> Option<String> {
        match index {
            "id" => Some(self.id.clone()),
            "card_id" => Some(self.card_id.clone()),
            "version" => Some(format!("{:010}", self.version)),
            "timestamp" => Some(self.timestamp.clone()),
            "fingerprint" => self.fingerprint.clone(),
            other => self.data.get(other).and_then(json_scalar),
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A row exactly as stored: its key and its undecoded JSON value.
///
/// Snapshots hold rows rather than decoded records, so a malformed record
/// comes back under the key it was stored under, with every field intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    /// Key the row is stored under.
    pub key: String,
    /// Stored value.
    pub value: Value,
}

impl StoredRow {
    /// Decode a raw key/value pair.
    pub fn from_raw(key: &[u8], value: &[u8]) -> Result<Self, crate::Error> {
        let key = std::str::from_utf8(key)
            .map_err(|e| crate::Error::InvalidData(format!("row key is not utf-8: {}", e)))?;
        Ok(Self {
            key: key.to_string(),
            value: serde_json::from_slice(value)?,
        })
    }

    /// Row for a well-formed card, keyed by its id.
    pub fn from_card(card: &Card) -> Result<Self, crate::Error> {
        Ok(Self {
            key: card.id.clone(),
            value: serde_json::to_value(card)?,
        })
    }

    /// Row for a version entry, keyed by its id.
    pub fn from_version(entry: &VersionEntry) -> Result<Self, crate::Error> {
        Ok(Self {
            key: entry.id.clone(),
            value: serde_json::to_value(entry)?,
        })
    }
}
