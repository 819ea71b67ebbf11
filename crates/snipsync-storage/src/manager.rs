use std::sync::Arc;

use snipsync_core::{
    keys, BackupSnapshot, Partition, Snippet, SnippetBackend, SnippetUpdate, StorageMode,
    StorageStatus, StoreError,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::backend::{BackupBackend, LocalBackend, QuotaLimits, SyncableBackend};
use crate::shadow::ShadowWriter;

/// The three partitions the manager works over.
#[derive(Clone)]
pub struct Partitions {
    pub syncable: Arc<dyn Partition>,
    /// Also holds the mode flag, the cache mirror and the data-loss flag.
    pub local: Arc<dyn Partition>,
    pub backup: Arc<dyn Partition>,
}

/// Single entry point for snippet reads and writes.
///
/// Owns the storage mode: starts in `sync`, and flips permanently to `local`
/// the first time the syncable partition rejects data for quota reasons.
/// Reads fall back silently; the first write that triggers the fallback
/// persists locally and then returns `StoreError::QuotaExceeded` so the
/// caller can warn once.
///
/// Every mutation is a read-modify-write of the whole collection, serialized
/// by an internal lock.
pub struct StorageManager {
    syncable: Arc<dyn SnippetBackend>,
    local: Arc<dyn SnippetBackend>,
    backup: Arc<BackupBackend>,
    settings: Arc<dyn Partition>,
    shadow: ShadowWriter,
    cache_tx: watch::Sender<Arc<Vec<Snippet>>>,
    write_lock: Mutex<()>,
}

impl StorageManager {
    /// Build the manager and its backends. Must be called inside a tokio runtime.
    pub fn new(partitions: Partitions, limits: QuotaLimits) -> Self {
        let syncable: Arc<dyn SnippetBackend> =
            Arc::new(SyncableBackend::new(partitions.syncable, limits));
        let local: Arc<dyn SnippetBackend> =
            Arc::new(LocalBackend::new(partitions.local.clone()));
        let backup = Arc::new(BackupBackend::new(partitions.backup));
        Self::from_backends(syncable, local, backup, partitions.local)
    }

    /// Build from explicit backends. `settings` is the local partition.
    pub fn from_backends(
        syncable: Arc<dyn SnippetBackend>,
        local: Arc<dyn SnippetBackend>,
        backup: Arc<BackupBackend>,
        settings: Arc<dyn Partition>,
    ) -> Self {
        let shadow = ShadowWriter::spawn(backup.clone());
        let (cache_tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            syncable,
            local,
            backup,
            settings,
            shadow,
            cache_tx,
            write_lock: Mutex::new(()),
        }
    }

    // =========================================================================
    // Mode
    // =========================================================================

    /// Current persisted mode. Defaults to `sync`.
    pub async fn mode(&self) -> Result<StorageMode, StoreError> {
        Ok(self
            .settings
            .get(keys::STORAGE_MODE)
            .await?
            .map(|raw| StorageMode::parse(&raw))
            .unwrap_or_default())
    }

    pub async fn storage_status(&self) -> Result<StorageStatus, StoreError> {
        Ok(self.mode().await?.into())
    }

    async fn fall_back_to_local(&self) -> Result<(), StoreError> {
        self.settings
            .set(keys::STORAGE_MODE, StorageMode::Local.as_str())
            .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read the canonical snippet list from whichever backend is active.
    #[instrument(skip(self), level = "debug")]
    pub async fn get_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        if self.mode().await? == StorageMode::Local {
            return self.local.get_snippets().await;
        }

        match self.syncable.get_snippets().await {
            Ok(snippets) => Ok(snippets),
            Err(StoreError::QuotaExceeded(violation)) => {
                warn!(
                    "Syncable read hit quota ({}), switching to local storage",
                    violation
                );
                self.fall_back_to_local().await?;
                self.local.get_snippets().await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_snippet(&self, id: &str) -> Result<Option<Snippet>, StoreError> {
        Ok(self.get_snippets().await?.into_iter().find(|s| s.id == id))
    }

    /// The read mirror as last persisted for the page-side consumer.
    pub async fn cached_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        let raw = self.settings.get(keys::CACHED_SNIPPETS).await?;
        Ok(crate::backend::decode_list(
            self.settings.name(),
            keys::CACHED_SNIPPETS,
            raw,
        ))
    }

    /// In-process observers of the read mirror.
    pub fn subscribe_cache(&self) -> watch::Receiver<Arc<Vec<Snippet>>> {
        self.cache_tx.subscribe()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persist the whole list to the active backend, then refresh the cache
    /// mirror and submit a shadow backup.
    async fn persist_snippets(&self, snippets: Vec<Snippet>) -> Result<(), StoreError> {
        let mut quota_error = None;

        if self.mode().await? == StorageMode::Local {
            self.local.save_snippets(&snippets).await?;
        } else {
            match self.syncable.save_snippets(&snippets).await {
                Ok(()) => {}
                Err(StoreError::QuotaExceeded(violation)) => {
                    warn!(
                        "Syncable storage quota exceeded ({}), switching to local storage",
                        violation
                    );
                    self.fall_back_to_local().await?;
                    self.local.save_snippets(&snippets).await?;
                    info!("Saved {} snippets to local storage after fallback", snippets.len());
                    quota_error = Some(StoreError::QuotaExceeded(violation));
                }
                Err(e) => return Err(e),
            }
        }

        self.after_write(snippets).await;

        match quota_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn after_write(&self, snippets: Vec<Snippet>) {
        match serde_json::to_string(&snippets) {
            Ok(serialized) => {
                if let Err(e) = self.settings.set(keys::CACHED_SNIPPETS, &serialized).await {
                    warn!("Failed to update snippet cache mirror: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize snippet cache mirror: {}", e),
        }

        self.cache_tx.send_replace(Arc::new(snippets.clone()));
        self.shadow.submit(snippets);
    }

    /// Add a snippet, replacing any existing one with the same id.
    #[instrument(skip(self, snippet), level = "debug", fields(id = %snippet.id))]
    pub async fn save_snippet(&self, snippet: Snippet) -> Result<Snippet, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snippets = self.get_snippets().await?;
        match snippets.iter_mut().find(|s| s.id == snippet.id) {
            Some(existing) => *existing = snippet.clone(),
            None => snippets.push(snippet.clone()),
        }
        self.persist_snippets(snippets).await?;
        debug!("Saved snippet {}", snippet.id);
        Ok(snippet)
    }

    #[instrument(skip(self, update), level = "debug")]
    pub async fn update_snippet(
        &self,
        id: &str,
        update: &SnippetUpdate,
    ) -> Result<Snippet, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snippets = self.get_snippets().await?;
        let snippet = snippets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        update.apply(snippet);
        let updated = snippet.clone();
        self.persist_snippets(snippets).await?;
        Ok(updated)
    }

    /// Delete a snippet. Returns `false` without writing if it was absent.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_snippet(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snippets = self.get_snippets().await?;
        let before = snippets.len();
        snippets.retain(|s| s.id != id);
        if snippets.len() == before {
            return Ok(false);
        }
        self.persist_snippets(snippets).await?;
        Ok(true)
    }

    /// Replace the whole collection.
    #[instrument(skip(self, snippets), level = "debug", fields(count = snippets.len()))]
    pub async fn bulk_save_snippets(&self, snippets: Vec<Snippet>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.persist_snippets(snippets).await
    }

    /// Read, transform and persist the whole list while holding the write lock.
    ///
    /// Returns the list as written. A quota fallback still persists it locally
    /// and then returns `StoreError::QuotaExceeded`.
    pub async fn modify<F>(&self, f: F) -> Result<Vec<Snippet>, StoreError>
    where
        F: FnOnce(Vec<Snippet>) -> Vec<Snippet> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let snippets = f(self.get_snippets().await?);
        self.persist_snippets(snippets.clone()).await?;
        Ok(snippets)
    }

    /// Bump the client-local usage counter. Returns the new count.
    pub async fn increment_usage(&self, id: &str) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snippets = self.get_snippets().await?;
        let snippet = snippets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        snippet.usage_count = snippet.usage_count.saturating_add(1);
        let count = snippet.usage_count;
        self.persist_snippets(snippets).await?;
        Ok(count)
    }

    /// Re-key a snippet after the server assigned it a new id.
    ///
    /// The server copy replaces the local one, keeping the larger local usage count.
    pub async fn replace_snippet(&self, old_id: &str, snippet: Snippet) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut snippets = self.get_snippets().await?;
        let mut replacement = snippet;
        match snippets.iter().position(|s| s.id == old_id) {
            Some(pos) => {
                replacement.usage_count = replacement.usage_count.max(snippets[pos].usage_count);
                snippets[pos] = replacement;
            }
            None => snippets.push(replacement),
        }
        // Drop any duplicate that already carried the new id.
        let mut seen = std::collections::HashSet::new();
        snippets.retain(|s| seen.insert(s.id.clone()));
        self.persist_snippets(snippets).await
    }

    /// Wipe the syncable and local lists and the cache mirror. The backup is kept.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.syncable.clear().await?;
        self.local.clear().await?;
        self.settings.remove(keys::CACHED_SNIPPETS).await?;
        self.cache_tx.send_replace(Arc::new(Vec::new()));
        info!("Cleared all snippet storage");
        Ok(())
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Return the last shadow backup without persisting it.
    ///
    /// Committing it back is a separate, explicit `bulk_save_snippets` call.
    pub async fn try_recover_from_backup(&self) -> Result<Option<BackupSnapshot>, StoreError> {
        self.backup.load_snapshot().await
    }

    /// Wait for queued shadow backups to be written.
    pub async fn flush_backups(&self) {
        self.shadow.flush().await;
    }

    /// Detect the syncable partition having been wiped from another device.
    ///
    /// Sets the persisted data-loss flag when in `sync` mode with an empty
    /// syncable list and a non-empty backup.
    pub async fn detect_sync_data_loss(&self) -> Result<bool, StoreError> {
        if self.mode().await? != StorageMode::Sync {
            return Ok(false);
        }
        if !self.syncable.get_snippets().await?.is_empty() {
            return Ok(false);
        }
        let backed_up = self
            .backup
            .load_snapshot()
            .await?
            .map(|s| !s.snippets.is_empty())
            .unwrap_or(false);
        if backed_up {
            warn!("Syncable snippets are empty but a backup exists; flagging sync data loss");
            self.settings.set(keys::SYNC_DATA_LOST, "true").await?;
        }
        Ok(backed_up)
    }

    pub async fn sync_data_lost(&self) -> Result<bool, StoreError> {
        Ok(self
            .settings
            .get(keys::SYNC_DATA_LOST)
            .await?
            .map(|v| v.trim() == "true")
            .unwrap_or(false))
    }

    pub async fn acknowledge_sync_data_loss(&self) -> Result<(), StoreError> {
        self.settings.remove(keys::SYNC_DATA_LOST).await?;
        Ok(())
    }
}
