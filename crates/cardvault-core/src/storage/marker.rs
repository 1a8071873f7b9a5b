//! Lightweight key/value state kept outside the main store.
//!
//! Holds the committed schema version marker. Values are plain text.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Error;

/// Process-wide key/value surface.
#[async_trait]
pub trait VersionMarker: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;
}

/// In-memory marker, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryVersionMarker {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryVersionMarker {
    /// Create an empty marker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionMarker for MemoryVersionMarker {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// File-backed marker: one file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileVersionMarker {
    dir: PathBuf,
}

impl FileVersionMarker {
    /// Use the given directory. It is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, Error> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.');
        if !valid || key.starts_with('.') {
            return Err(Error::InvalidData(format!("invalid marker key: {:?}", key)));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl VersionMarker for FileVersionMarker {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write-then-rename so readers never see a partial value.
        let tmp = self.dir.join(format!(".{}.tmp", key));
        tokio::fs::write(&tmp, value.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_marker() {
        let marker = MemoryVersionMarker::new();
        assert_eq!(marker.get("db_version").await.unwrap(), None);
        marker.set("db_version", "3").await.unwrap();
        assert_eq!(marker.get("db_version").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_file_marker_roundtrip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let marker = FileVersionMarker::new(dir.path().join("state"));

        assert_eq!(marker.get("cardvault_db_version").await.unwrap(), None);
        marker.set("cardvault_db_version", "2").await.unwrap();
        marker.set("cardvault_db_version", "3").await.unwrap();
        assert_eq!(
            marker.get("cardvault_db_version").await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[tokio::test]
    async fn test_file_marker_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let marker = FileVersionMarker::new(dir.path());
        assert!(marker.set("../escape", "1").await.is_err());
        assert!(marker.get(".hidden").await.is_err());
    }
}
