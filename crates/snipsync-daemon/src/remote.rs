//! Remote snippet service seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snipsync_core::{Snippet, SyncDelta};

use crate::error::RemoteError;

/// Response of `POST /auth/refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    /// Seconds until the new access token expires.
    pub expires_in: u64,
    /// Present when the service rotates the refresh token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Calls the sync engine makes against the snippet service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `GET /snippets/sync?updated_since=...`
    async fn fetch_delta(&self, since: DateTime<Utc>) -> Result<SyncDelta, RemoteError>;

    /// `GET /snippets`
    async fn fetch_all(&self) -> Result<Vec<Snippet>, RemoteError>;

    /// `POST /snippets`. Returns the stored snippet with its server id.
    async fn create_snippet(&self, data: &serde_json::Value) -> Result<Snippet, RemoteError>;

    /// `PUT /snippets/{id}`
    async fn update_snippet(&self, id: &str, data: &serde_json::Value) -> Result<(), RemoteError>;

    /// `DELETE /snippets/{id}`
    async fn delete_snippet(&self, id: &str) -> Result<(), RemoteError>;

    /// `POST /auth/refresh`
    async fn refresh_token(&self) -> Result<TokenGrant, RemoteError>;

    /// Reachability check. Any HTTP response counts as reachable.
    async fn ping(&self) -> Result<(), RemoteError>;
}
