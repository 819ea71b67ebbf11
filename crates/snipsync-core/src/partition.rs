use async_trait::async_trait;

use crate::error::StoreError;

/// One independently addressable key-value partition.
///
/// Values are JSON text. Implementations decide where bytes live; quota
/// enforcement for the syncable partition happens in the backend above it.
#[async_trait]
pub trait Partition: Send + Sync {
    /// Partition name, for logs.
    fn name(&self) -> &str;

    /// Read a value. `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any existing one.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys currently stored.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Remove every key.
    async fn clear(&self) -> Result<(), StoreError>;
}
