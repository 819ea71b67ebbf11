use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use snipsync_core::{Partition, StoreError};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// File-backed partition.
///
/// The whole partition is one JSON object at `{dir}/{name}.json`:
/// ```text
/// {dir}/
///   sync.json      # syncable partition
///   local.json     # local partition (settings, queue, cache mirror)
///   backup.json    # shadow backups
/// ```
/// Writes go through a temp file and a rename so a crash never leaves a torn file.
#[derive(Debug)]
pub struct FilePartition {
    name: String,
    path: PathBuf,
    /// Serializes read-modify-write of the backing file within this process.
    lock: Mutex<()>,
}

impl FilePartition {
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        let path = dir.as_ref().join(format!("{}.json", name));
        Self {
            name,
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(StoreError::Io(format!(
                    "Failed to read partition file {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        match serde_json::from_str(&content) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(
                    "Partition file {} is corrupt, treating as empty: {}",
                    self.path.display(),
                    e
                );
                Ok(BTreeMap::new())
            }
        }
    }

    async fn store(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Io(format!(
                    "Failed to create partition directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let serialized = serde_json::to_string(map)?;
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, serialized).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            StoreError::Io(format!(
                "Failed to rename temp file to {}: {}",
                self.path.display(),
                e
            ))
        })?;

        debug!("Stored partition {} ({} keys)", self.name, map.len());
        Ok(())
    }
}

#[async_trait]
impl Partition for FilePartition {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), level = "debug", fields(partition = %self.name))]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    #[instrument(skip(self, value), level = "debug", fields(partition = %self.name, value_len = value.len()))]
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        map.insert(key.to_string(), value.to_string());
        self.store(&map).await
    }

    #[instrument(skip(self), level = "debug", fields(partition = %self.name))]
    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.lock.lock().await;
        let mut map = self.load().await?;
        if map.remove(key).is_none() {
            return Ok(false);
        }
        self.store(&map).await?;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        self.store(&BTreeMap::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();

        let partition = FilePartition::new(temp_dir.path(), "local");
        partition.set("syncQueue", "{}").await.unwrap();
        partition.set("storageMode", "local").await.unwrap();

        let reopened = FilePartition::new(temp_dir.path(), "local");
        assert_eq!(
            reopened.get("storageMode").await.unwrap().as_deref(),
            Some("local")
        );
        let mut keys = reopened.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["storageMode".to_string(), "syncQueue".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let partition = FilePartition::new(temp_dir.path().join("nested"), "sync");
        assert_eq!(partition.get("snippets").await.unwrap(), None);
        assert!(partition.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let partition = FilePartition::new(temp_dir.path(), "sync");
        tokio::fs::write(partition.path(), b"{not json").await.unwrap();

        assert_eq!(partition.get("snippets").await.unwrap(), None);

        // A write replaces the corrupt file with a valid one.
        partition.set("snippets", "[]").await.unwrap();
        assert_eq!(partition.get("snippets").await.unwrap().as_deref(), Some("[]"));
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let temp_dir = TempDir::new().unwrap();
        let partition = FilePartition::new(temp_dir.path(), "backup");
        partition.set("a", "1").await.unwrap();
        partition.set("b", "2").await.unwrap();

        assert!(partition.remove("a").await.unwrap());
        assert!(!partition.remove("a").await.unwrap());

        partition.clear().await.unwrap();
        assert!(partition.keys().await.unwrap().is_empty());
    }
}
