//! Key encoding, identifiers, and clock helpers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Separator between table and index names in the index catalog.
const INDEX_KEY_SEPARATOR: u8 = b'/';

/// Counter to keep generated ids unique within one timestamp tick.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Current wall-clock time as an RFC 3339 string.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Generate a unique, time-ordered identifier with the given prefix.
///
/// Format: `<prefix>_<16 hex chars of micros><8 hex chars of counter>`.
pub fn generate_id(prefix: &str) -> String {
    let ts = current_timestamp();
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed) as u32;
    format!("{}_{}{}", prefix, hex::encode(ts.to_be_bytes()), hex::encode(counter.to_be_bytes()))
}

/// Encode an index catalog key: `table/index`.
pub fn index_catalog_key(table: &str, index: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(table.len() + index.len() + 1);
    key.extend_from_slice(table.as_bytes());
    key.push(INDEX_KEY_SEPARATOR);
    key.extend_from_slice(index.as_bytes());
    key
}

/// Decode an index catalog key into `(table, index)`.
pub fn decode_index_catalog_key(bytes: &[u8]) -> Option<(String, String)> {
    let pos = bytes.iter().position(|b| *b == INDEX_KEY_SEPARATOR)?;
    let table = std::str::from_utf8(&bytes[..pos]).ok()?;
    let index = std::str::from_utf8(&bytes[pos + 1..]).ok()?;
    if table.is_empty() || index.is_empty() {
        return None;
    }
    Some((table.to_string(), index.to_string()))
}

/// Name of the sled tree materializing a secondary index.
pub fn index_tree_name(table: &str, index: &str) -> String {
    format!("index:{}:{}", table, index)
}

/// Encode a secondary index entry: `value \0 record_id`.
///
/// The NUL separator keeps all entries for one value contiguous.
pub fn index_entry_key(value: &str, record_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + record_id.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key.extend_from_slice(record_id.as_bytes());
    key
}
