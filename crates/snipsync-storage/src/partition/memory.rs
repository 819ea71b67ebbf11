use async_trait::async_trait;
use dashmap::DashMap;
use snipsync_core::{Partition, StoreError};

/// In-memory partition. Used for tests and for ephemeral contexts.
#[derive(Debug, Default)]
pub struct MemoryPartition {
    name: String,
    entries: DashMap<String, String>,
}

impl MemoryPartition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Partition for MemoryPartition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.entries.clear();
        Ok(())
    }
}
