use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use snipsync_core::{keys, Partition, QuotaViolation, Snippet, SnippetBackend, StoreError};
use tracing::{debug, instrument, warn};

/// Limits of the host-replicated partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Total bytes across all keys and values.
    pub total_bytes: usize,
    /// Bytes of a single key plus its value.
    pub bytes_per_item: usize,
    /// Number of keys.
    pub max_items: usize,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            total_bytes: 102_400,
            bytes_per_item: 8_192,
            max_items: 512,
        }
    }
}

impl QuotaLimits {
    /// Size of one entry as the host accounts for it.
    pub fn entry_size(key: &str, value: &str) -> usize {
        key.len() + value.len()
    }

    /// Check a complete key set against the limits.
    pub fn check<'a, I>(&self, entries: I) -> Result<(), QuotaViolation>
    where
        I: IntoIterator<Item = (&'a str, usize)>,
    {
        let mut total = 0usize;
        let mut count = 0usize;

        for (key, size) in entries {
            if size > self.bytes_per_item {
                return Err(QuotaViolation::ItemBytes {
                    key: key.to_string(),
                    size,
                    limit: self.bytes_per_item,
                });
            }
            total += size;
            count += 1;
        }

        if count > self.max_items {
            return Err(QuotaViolation::ItemCount {
                count,
                limit: self.max_items,
            });
        }

        if total > self.total_bytes {
            return Err(QuotaViolation::TotalBytes {
                used: total,
                limit: self.total_bytes,
            });
        }

        Ok(())
    }
}

/// Backend over the small-quota partition replicated across devices.
///
/// Layout:
/// ```text
/// snippets          -> ["id1", "id2", ...]   (index, in list order)
/// snippet:{id}      -> {...}                 (one entry per snippet)
/// ```
/// A write is validated against [`QuotaLimits`] as a whole before anything is
/// written, so an over-quota list never leaves a partial state behind.
pub struct SyncableBackend {
    partition: Arc<dyn Partition>,
    limits: QuotaLimits,
}

impl SyncableBackend {
    pub fn new(partition: Arc<dyn Partition>, limits: QuotaLimits) -> Self {
        Self { partition, limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    fn is_snippet_key(key: &str) -> bool {
        key == keys::SNIPPETS || key.starts_with(keys::SNIPPET_ITEM_PREFIX)
    }

    /// Serialized entries for a list: index first, then one per snippet.
    fn encode(snippets: &[Snippet]) -> Result<Vec<(String, String)>, StoreError> {
        let ids: Vec<&str> = snippets.iter().map(|s| s.id.as_str()).collect();
        let mut entries = Vec::with_capacity(snippets.len() + 1);
        entries.push((keys::SNIPPETS.to_string(), serde_json::to_string(&ids)?));
        for snippet in snippets {
            entries.push((keys::snippet_item(&snippet.id), serde_json::to_string(snippet)?));
        }
        Ok(entries)
    }
}

#[async_trait]
impl SnippetBackend for SyncableBackend {
    fn name(&self) -> &'static str {
        "sync"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        let Some(raw_index) = self.partition.get(keys::SNIPPETS).await? else {
            return Ok(Vec::new());
        };

        let ids: Vec<String> = match serde_json::from_str(&raw_index) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Corrupt snippet index in syncable partition, treating as empty: {}", e);
                return Ok(Vec::new());
            }
        };

        let mut snippets = Vec::with_capacity(ids.len());
        for id in &ids {
            let key = keys::snippet_item(id);
            match self.partition.get(&key).await? {
                Some(raw) => match serde_json::from_str::<Snippet>(&raw) {
                    Ok(snippet) => snippets.push(snippet),
                    Err(e) => warn!("Skipping corrupt syncable entry '{}': {}", key, e),
                },
                None => warn!("Snippet index references missing entry '{}'", key),
            }
        }

        Ok(snippets)
    }

    #[instrument(skip(self, snippets), level = "debug", fields(count = snippets.len()))]
    async fn save_snippets(&self, snippets: &[Snippet]) -> Result<(), StoreError> {
        let entries = Self::encode(snippets)?;

        // Keys that are not ours still count against the quota.
        let existing = self.partition.keys().await?;
        let mut foreign = Vec::new();
        for key in existing.iter().filter(|k| !Self::is_snippet_key(k)) {
            if let Some(value) = self.partition.get(key).await? {
                foreign.push((key.clone(), QuotaLimits::entry_size(key, &value)));
            }
        }

        let sizes = entries
            .iter()
            .map(|(k, v)| (k.as_str(), QuotaLimits::entry_size(k, v)))
            .chain(foreign.iter().map(|(k, size)| (k.as_str(), *size)));
        self.limits.check(sizes).map_err(StoreError::QuotaExceeded)?;

        // Items first, then the index, then stale items: a reader never sees an
        // index entry without its item.
        for (key, value) in entries.iter().skip(1) {
            self.partition.set(key, value).await?;
        }
        let (index_key, index_value) = &entries[0];
        self.partition.set(index_key, index_value).await?;

        let live: HashSet<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        for key in existing
            .iter()
            .filter(|k| k.starts_with(keys::SNIPPET_ITEM_PREFIX) && !live.contains(k.as_str()))
        {
            self.partition.remove(key).await?;
        }

        debug!("Saved {} snippets to syncable backend", snippets.len());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for key in self.partition.keys().await? {
            if Self::is_snippet_key(&key) {
                self.partition.remove(&key).await?;
            }
        }
        Ok(())
    }
}
