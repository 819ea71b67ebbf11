use std::sync::Arc;

use async_trait::async_trait;
use snipsync_core::{keys, Partition, Snippet, SnippetBackend, StoreError};
use tracing::{debug, instrument};

use super::decode_list;

/// Device-private backend. No quota handling: the whole array lives under one key.
pub struct LocalBackend {
    partition: Arc<dyn Partition>,
}

impl LocalBackend {
    pub fn new(partition: Arc<dyn Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait]
impl SnippetBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_snippets(&self) -> Result<Vec<Snippet>, StoreError> {
        let raw = self.partition.get(keys::SNIPPETS).await?;
        Ok(decode_list(self.partition.name(), keys::SNIPPETS, raw))
    }

    #[instrument(skip(self, snippets), level = "debug", fields(count = snippets.len()))]
    async fn save_snippets(&self, snippets: &[Snippet]) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(snippets)?;
        self.partition.set(keys::SNIPPETS, &serialized).await?;
        debug!("Saved {} snippets to local backend", snippets.len());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.partition.remove(keys::SNIPPETS).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::MemoryPartition;

    #[tokio::test]
    async fn test_round_trip_and_clear() {
        let backend = LocalBackend::new(Arc::new(MemoryPartition::new("local")));
        assert!(backend.get_snippets().await.unwrap().is_empty());

        let snippets = vec![Snippet::new("/a", "alpha"), Snippet::new("/b", "beta")];
        backend.save_snippets(&snippets).await.unwrap();
        assert_eq!(backend.get_snippets().await.unwrap(), snippets);

        backend.clear().await.unwrap();
        assert!(backend.get_snippets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_json_reads_as_empty() {
        let partition = Arc::new(MemoryPartition::new("local"));
        partition.set(keys::SNIPPETS, "[{\"id\": ").await.unwrap();

        let backend = LocalBackend::new(partition);
        assert!(backend.get_snippets().await.unwrap().is_empty());
    }
}
