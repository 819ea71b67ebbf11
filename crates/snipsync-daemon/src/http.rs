//! reqwest implementation of [`RemoteApi`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use snipsync_core::{Snippet, SnippetPage, SyncDelta};
use tracing::{debug, instrument, warn};

use crate::auth::AuthStore;
use crate::error::RemoteError;
use crate::remote::{RemoteApi, TokenGrant};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the snippet service.
///
/// Every request carries the current access token as a bearer header and is
/// aborted after the configured timeout.
pub struct HttpRemote {
    http_client: HttpClient,
    base_url: String,
    auth: Arc<AuthStore>,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        auth: Arc<AuthStore>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http_client = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the bearer token, if there is one.
    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.access_token().await {
            Ok(Some(token)) => request.bearer_auth(token),
            Ok(None) => request,
            Err(e) => {
                warn!("Could not read access token: {}", e);
                request
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self.authorized(request).await.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status, body))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    #[instrument(skip(self), level = "debug")]
    async fn fetch_delta(&self, since: DateTime<Utc>) -> Result<SyncDelta, RemoteError> {
        let since = since.to_rfc3339_opts(SecondsFormat::Millis, true);
        let request = self
            .http_client
            .get(self.url("/snippets/sync"))
            .query(&[("updated_since", since.as_str())]);
        let delta: SyncDelta = Self::json(self.send(request).await?).await?;
        debug!(
            "Delta since {}: {} created, {} updated, {} deleted",
            since,
            delta.created.len(),
            delta.updated.len(),
            delta.deleted.len()
        );
        Ok(delta)
    }

    #[instrument(skip(self), level = "debug")]
    async fn fetch_all(&self) -> Result<Vec<Snippet>, RemoteError> {
        let request = self.http_client.get(self.url("/snippets"));
        let page: SnippetPage = Self::json(self.send(request).await?).await?;
        debug!("Fetched full list ({} of {})", page.data.len(), page.count);
        Ok(page.data)
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn create_snippet(&self, data: &serde_json::Value) -> Result<Snippet, RemoteError> {
        let request = self.http_client.post(self.url("/snippets")).json(data);
        Self::json(self.send(request).await?).await
    }

    #[instrument(skip(self, data), level = "debug")]
    async fn update_snippet(&self, id: &str, data: &serde_json::Value) -> Result<(), RemoteError> {
        let request = self
            .http_client
            .put(self.url(&format!("/snippets/{}", id)))
            .json(data);
        self.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_snippet(&self, id: &str) -> Result<(), RemoteError> {
        let request = self.http_client.delete(self.url(&format!("/snippets/{}", id)));
        self.send(request).await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn refresh_token(&self) -> Result<TokenGrant, RemoteError> {
        let refresh_token = self.auth.refresh_token().await.unwrap_or_else(|e| {
            warn!("Could not read refresh token: {}", e);
            None
        });
        let request = self
            .http_client
            .post(self.url("/auth/refresh"))
            .json(&serde_json::json!({ "refreshToken": refresh_token }));
        Self::json(self.send(request).await?).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        // Any status means the service answered.
        self.http_client.get(self.url("/health")).send().await?;
        Ok(())
    }
}
