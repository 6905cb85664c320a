//! Implements WatermarkStore using a JSON file.
//!
//! Holds the highest acknowledged update_id so a restart resumes after it.

use crate::domain::{DomainError, UpdateId};
use crate::ports::WatermarkStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Default, Serialize, Deserialize)]
struct WatermarkData {
    last_update_id: Option<UpdateId>,
}

pub struct JsonWatermarkStore {
    path: PathBuf,
}

impl JsonWatermarkStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait::async_trait]
impl WatermarkStore for JsonWatermarkStore {
    async fn load(&self) -> Result<Option<UpdateId>, DomainError> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DomainError::Storage(format!("read watermark: {}", e))),
        };
        match serde_json::from_str::<WatermarkData>(&raw) {
            Ok(data) => Ok(data.last_update_id),
            Err(e) => {
                // Resume from the feed's own position.
                warn!(path = %self.path.display(), error = %e, "corrupt watermark file ignored");
                Ok(None)
            }
        }
    }

    /// Write temp file, fsync, then rename over the target.
    async fn store(&self, watermark: UpdateId) -> Result<(), DomainError> {
        let data = WatermarkData {
            last_update_id: Some(watermark),
        };
        let json =
            serde_json::to_string_pretty(&data).map_err(|e| DomainError::Storage(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DomainError::Storage(format!("create dir: {}", e)))?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&temp_path)
            .await
            .map_err(|e| DomainError::Storage(format!("create temp file: {}", e)))?;
        f.write_all(json.as_bytes())
            .await
            .map_err(|e| DomainError::Storage(format!("write temp file: {}", e)))?;
        f.sync_all()
            .await
            .map_err(|e| DomainError::Storage(format!("sync temp file: {}", e)))?;
        drop(f);

        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| DomainError::Storage(format!("atomic rename failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonWatermarkStore::new(dir.path().join("watermark.json"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("watermark.json");
        let store = JsonWatermarkStore::new(&path);
        store.store(41).await.unwrap();
        store.store(42).await.unwrap();
        assert_eq!(JsonWatermarkStore::new(&path).load().await.unwrap(), Some(42));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watermark.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(JsonWatermarkStore::new(&path).load().await.unwrap(), None);
    }
}
