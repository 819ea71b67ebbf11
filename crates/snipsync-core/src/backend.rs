use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::Snippet;

/// Uniform contract over one partition holding the full snippet collection.
///
/// Every write replaces the whole collection; there is no per-item update.
#[async_trait]
pub trait SnippetBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Read the stored snippets. Corrupt data reads as an empty list.
    async fn get_snippets(&self) -> Result<Vec<Snippet>, StoreError>;

    /// Replace the stored snippets.
    ///
    /// # Errors
    /// `StoreError::QuotaExceeded` if the partition cannot hold the list.
    async fn save_snippets(&self, snippets: &[Snippet]) -> Result<(), StoreError>;

    /// Remove all stored snippets.
    async fn clear(&self) -> Result<(), StoreError>;
}
