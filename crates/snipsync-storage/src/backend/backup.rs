use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use snipsync_core::{keys, BackupSnapshot, Partition, Snippet, SnippetBackend, StoreError};
use tracing::{debug, instrument, warn};

/// Shadow-copy backend used only for disaster recovery.
pub struct BackupBackend {
    partition: Arc<dyn Partition>,
}

impl BackupBackend {
    pub fn new(partition: Arc<dyn Partition>) -> Self {
        Self { partition }
    }

    /// Read the last snapshot, with its timestamp. Never writes.
    #[instrument(skip(self), level = "debug")]
    pub async fn load_snapshot(&self) -> Result<Option<BackupSnapshot>, StoreError> {
        let Some(raw) = self.partition.get(keys::SNIPPETS_BACKUP).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Corrupt backup snapshot, ignoring: {}", e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SnippetBackend for BackupBackend {
    fn name(&self) -> &'static str {
        "backup"
    }

    async fn get_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        Ok(self
            .load_snapshot()
            .await?
            .map(|s| s.snippets)
            .unwrap_or_default())
    }

    #[instrument(skip(self, snippets), level = "debug", fields(count = snippets.len()))]
    async fn save_snippets(&self, snippets: &[Snippet]) -> Result<(), StoreError> {
        let snapshot = BackupSnapshot {
            snippets: snippets.to_vec(),
            saved_at: Utc::now(),
        };
        let serialized = serde_json::to_string(&snapshot)?;
        self.partition.set(keys::SNIPPETS_BACKUP, &serialized).await?;
        debug!("Wrote backup snapshot of {} snippets", snippets.len());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.partition.remove(keys::SNIPPETS_BACKUP).await?;
        Ok(())
    }
}
