//! Incremental reconciliation of the local snapshot with the server.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use snipsync_core::{keys, OperationType, Partition, Snippet, StoreError, SyncDelta};
use snipsync_storage::{OperationQueue, StorageManager};
use tracing::{debug, info, instrument, warn};

use crate::error::{RemoteError, Result};
use crate::remote::RemoteApi;

/// Bounded exponential backoff for transient fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay after `current`, doubled and capped.
    pub fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Where the snippets in a [`SyncReport`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSource {
    /// Delta applied on top of the local snapshot.
    Delta { applied: usize },
    /// Server rejected the delta request; the full list replaced the snapshot.
    Full,
    /// Retries exhausted. Local data is shown and the error is retryable.
    Cached { error: RemoteError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub snippets: Vec<Snippet>,
    pub source: SyncSource,
    /// Persisting the result switched storage to local mode.
    pub quota_fallback: bool,
}

enum Fetched {
    Delta(SyncDelta),
    Full(Vec<Snippet>),
}

/// Apply a server delta to a snapshot: deletions, then updates, then creations.
///
/// Updates for unknown ids are inserted; creations for known ids are ignored.
/// Applying the same delta twice gives the same result as applying it once.
pub fn apply_delta(mut snippets: Vec<Snippet>, delta: &SyncDelta) -> Vec<Snippet> {
    let deleted: HashSet<&str> = delta.deleted.iter().map(|d| d.id.as_str()).collect();
    snippets.retain(|s| !deleted.contains(s.id.as_str()));

    for incoming in &delta.updated {
        match snippets.iter_mut().find(|s| s.id == incoming.id) {
            Some(existing) => {
                let usage_count = existing.usage_count.max(incoming.usage_count);
                *existing = incoming.clone();
                existing.usage_count = usage_count;
            }
            None => snippets.push(incoming.clone()),
        }
    }

    for incoming in &delta.created {
        if !snippets.iter().any(|s| s.id == incoming.id) {
            snippets.push(incoming.clone());
        }
    }

    snippets
}

/// Keeps the local snapshot aligned with the server using `updated_since` deltas.
pub struct IncrementalSyncReconciler {
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteApi>,
    settings: Arc<dyn Partition>,
    queue: Option<Arc<OperationQueue>>,
    policy: RetryPolicy,
}

impl IncrementalSyncReconciler {
    /// `settings` is the local partition holding the per-user checkpoint.
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteApi>,
        settings: Arc<dyn Partition>,
    ) -> Self {
        Self {
            storage,
            remote,
            settings,
            queue: None,
            policy: RetryPolicy::default(),
        }
    }

    /// Keep snippets with unsent creates when a full list replaces the snapshot.
    pub fn with_queue(mut self, queue: Arc<OperationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Checkpoint for `user_id`. Epoch when none is recorded or it belongs to another user.
    pub async fn last_sync_at(&self, user_id: &str) -> std::result::Result<DateTime<Utc>, StoreError> {
        let owner = self.settings.get(keys::LAST_SYNC_USER_ID).await?;
        if owner.as_deref() != Some(user_id) {
            return Ok(DateTime::<Utc>::UNIX_EPOCH);
        }
        let Some(raw) = self.settings.get(keys::LAST_SYNC_AT).await? else {
            return Ok(DateTime::<Utc>::UNIX_EPOCH);
        };
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(dt) => Ok(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring unparseable sync checkpoint '{}': {}", raw, e);
                Ok(DateTime::<Utc>::UNIX_EPOCH)
            }
        }
    }

    async fn record_checkpoint(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), StoreError> {
        self.settings.set(keys::LAST_SYNC_AT, &at.to_rfc3339()).await?;
        self.settings.set(keys::LAST_SYNC_USER_ID, user_id).await
    }

    /// Pull server changes since the last checkpoint and persist the result.
    #[instrument(skip(self), level = "debug")]
    pub async fn sync(&self, user_id: &str) -> Result<SyncReport> {
        let since = self.last_sync_at(user_id).await?;
        // Taken before the request so in-flight server changes are re-delivered.
        let started = Utc::now();

        let fetched = match self.fetch_with_backoff(since).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_transient() => {
                warn!("Sync failed after {} attempts, serving cached snippets: {}", self.policy.max_attempts, e);
                return Ok(SyncReport {
                    snippets: self.storage.get_snippets().await?,
                    source: SyncSource::Cached { error: e },
                    quota_fallback: false,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let (written, source) = match fetched {
            Fetched::Delta(delta) => {
                let applied = delta.len();
                if delta.is_empty() {
                    debug!("Delta since {} is empty", since);
                    self.record_checkpoint(user_id, started).await?;
                    return Ok(SyncReport {
                        snippets: self.storage.get_snippets().await?,
                        source: SyncSource::Delta { applied },
                        quota_fallback: false,
                    });
                }
                info!(
                    "Applying delta: {} created, {} updated, {} deleted",
                    delta.created.len(),
                    delta.updated.len(),
                    delta.deleted.len()
                );
                let written = self
                    .storage
                    .modify(|local| apply_delta(local, &delta))
                    .await;
                (written, SyncSource::Delta { applied })
            }
            Fetched::Full(server) => {
                info!("Replacing snapshot with full list of {} snippets", server.len());
                let unsent = self.unsent_creates().await?;
                let written = self
                    .storage
                    .modify(|local| merge_full(local, server, &unsent, started))
                    .await;
                (written, SyncSource::Full)
            }
        };

        let (snippets, quota_fallback) = match written {
            Ok(snippets) => (snippets, false),
            Err(StoreError::QuotaExceeded(violation)) => {
                warn!("Synced snippets stored locally after quota fallback: {}", violation);
                (self.storage.get_snippets().await?, true)
            }
            Err(e) => return Err(e.into()),
        };

        self.record_checkpoint(user_id, started).await?;
        Ok(SyncReport {
            snippets,
            source,
            quota_fallback,
        })
    }

    async fn fetch(&self, since: DateTime<Utc>) -> std::result::Result<Fetched, RemoteError> {
        match self.remote.fetch_delta(since).await {
            Ok(delta) => Ok(Fetched::Delta(delta)),
            Err(RemoteError::BadRequest(body)) => {
                info!("Delta request rejected ({}), fetching full list", body);
                self.remote.fetch_all().await.map(Fetched::Full)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_with_backoff(
        &self,
        since: DateTime<Utc>,
    ) -> std::result::Result<Fetched, RemoteError> {
        let mut delay = self.policy.base_delay;
        let mut attempt = 1;
        loop {
            match self.fetch(since).await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Sync fetch failed ({}), retrying",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = self.policy.next_delay(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Ids of snippets whose create is still queued.
    async fn unsent_creates(&self) -> Result<HashSet<String>> {
        Ok(match &self.queue {
            Some(queue) => queue
                .pending()
                .await?
                .into_iter()
                .filter(|op| op.op_type == OperationType::Create)
                .filter_map(|op| op.snippet_id)
                .collect(),
            None => HashSet::new(),
        })
    }
}

/// The full list is canonical, except for local snippets that the server cannot
/// know yet: those with a queued create, and those created after the request went out.
fn merge_full(
    local: Vec<Snippet>,
    server: Vec<Snippet>,
    unsent: &HashSet<String>,
    requested_at: DateTime<Utc>,
) -> Vec<Snippet> {
    let mut merged: Vec<Snippet> = server
        .into_iter()
        .map(|mut s| {
            if let Some(existing) = local.iter().find(|l| l.id == s.id) {
                s.usage_count = s.usage_count.max(existing.usage_count);
            }
            s
        })
        .collect();
    for snippet in local {
        let pending = unsent.contains(&snippet.id) || snippet.created_at > requested_at;
        if pending && !merged.iter().any(|s| s.id == snippet.id) {
            merged.push(snippet);
        }
    }
    merged
}
