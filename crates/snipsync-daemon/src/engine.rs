//! Composition root: mutation entry points and the background loops.

use std::sync::Arc;
use std::time::Duration;

use snipsync_core::{OperationType, Partition, Snippet, SnippetUpdate, StoreError};
use snipsync_storage::{OperationQueue, QuotaLimits, StorageManager};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthStore;
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{RemoteError, Result, SyncError};
use crate::http::DEFAULT_TIMEOUT;
use crate::reconcile::{IncrementalSyncReconciler, RetryPolicy, SyncReport, SyncSource};
use crate::remote::RemoteApi;
use crate::sync_queue::{DrainReport, SyncQueueProcessor};
use crate::token_refresh::{RefreshPolicy, TokenRefreshHandle};

/// Tunables for the engine and its background loops.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Owner of the sync checkpoint.
    pub user_id: String,
    pub sync_interval: Duration,
    pub drain_interval: Duration,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
    /// `None` keeps failed queue operations forever.
    pub max_operation_retries: Option<u32>,
    pub quota: QuotaLimits,
    pub reconcile: RetryPolicy,
    pub refresh: RefreshPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            sync_interval: Duration::from_secs(300),
            drain_interval: Duration::from_secs(60),
            probe_interval: Duration::from_secs(30),
            request_timeout: DEFAULT_TIMEOUT,
            max_operation_retries: None,
            quota: QuotaLimits::default(),
            reconcile: RetryPolicy::default(),
            refresh: RefreshPolicy::default(),
        }
    }
}

/// How a mutation reached the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Stored locally and queued for the next drain.
    Queued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome<T> {
    pub value: T,
    pub delivery: Delivery,
    /// This write switched storage to local mode. Warn the user once.
    pub quota_warning: bool,
}

/// Treat the one-time quota error as a warning: the write is already durable locally.
fn absorb_quota<T>(result: std::result::Result<T, StoreError>) -> Result<(Option<T>, bool)> {
    match result {
        Ok(value) => Ok((Some(value), false)),
        Err(StoreError::QuotaExceeded(violation)) => {
            warn!("Storage switched to local mode: {}", violation);
            Ok((None, true))
        }
        Err(e) => Err(e.into()),
    }
}

pub struct SyncEngine {
    storage: Arc<StorageManager>,
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteApi>,
    auth: Arc<AuthStore>,
    connectivity: Arc<ConnectivityMonitor>,
    processor: SyncQueueProcessor,
    reconciler: IncrementalSyncReconciler,
    settings: EngineSettings,
}

impl SyncEngine {
    /// `local` is the local partition, which holds the sync checkpoint.
    pub fn new(
        storage: Arc<StorageManager>,
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteApi>,
        auth: Arc<AuthStore>,
        connectivity: Arc<ConnectivityMonitor>,
        local: Arc<dyn Partition>,
        settings: EngineSettings,
    ) -> Self {
        let processor = SyncQueueProcessor::new(
            queue.clone(),
            storage.clone(),
            remote.clone(),
            connectivity.clone(),
        )
        .with_max_retries(settings.max_operation_retries);
        let reconciler = IncrementalSyncReconciler::new(storage.clone(), remote.clone(), local)
            .with_queue(queue.clone())
            .with_policy(settings.reconcile);
        Self {
            storage,
            queue,
            remote,
            auth,
            connectivity,
            processor,
            reconciler,
            settings,
        }
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Send directly only when online with nothing queued ahead.
    async fn can_send_directly(&self) -> Result<bool> {
        Ok(self.connectivity.is_online() && self.queue.is_empty().await?)
    }

    /// Whether a failed direct send should be queued instead of surfaced.
    fn defer_after(&self, error: &RemoteError) -> bool {
        if error.is_connectivity() {
            self.connectivity.set_online(false);
        }
        error.is_transient() || error.is_auth()
    }

    #[instrument(skip(self, snippet), level = "debug", fields(id = %snippet.id))]
    pub async fn create_snippet(&self, snippet: Snippet) -> Result<MutationOutcome<Snippet>> {
        let (_, quota_warning) = absorb_quota(self.storage.save_snippet(snippet.clone()).await)?;
        let data = serde_json::to_value(&snippet).map_err(StoreError::from)?;

        if self.can_send_directly().await? {
            match self.remote.create_snippet(&data).await {
                Ok(mut created) => {
                    let mut rekey_warning = false;
                    if created.id != snippet.id {
                        created.usage_count = created.usage_count.max(snippet.usage_count);
                        (_, rekey_warning) = absorb_quota(
                            self.storage.replace_snippet(&snippet.id, created.clone()).await,
                        )?;
                    }
                    return Ok(MutationOutcome {
                        value: created,
                        delivery: Delivery::Sent,
                        quota_warning: quota_warning || rekey_warning,
                    });
                }
                Err(e) if self.defer_after(&e) => {
                    warn!("Create failed ({}), queueing for later", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue
            .enqueue(OperationType::Create, Some(snippet.id.clone()), Some(data))
            .await?;
        Ok(MutationOutcome {
            value: snippet,
            delivery: Delivery::Queued,
            quota_warning,
        })
    }

    #[instrument(skip(self, update), level = "debug")]
    pub async fn update_snippet(
        &self,
        id: &str,
        update: SnippetUpdate,
    ) -> Result<MutationOutcome<Snippet>> {
        let (updated, quota_warning) =
            absorb_quota(self.storage.update_snippet(id, &update).await)?;
        let value = match updated {
            Some(snippet) => snippet,
            None => self
                .storage
                .get_snippet(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?,
        };
        let data = serde_json::to_value(&update).map_err(StoreError::from)?;

        let delivery = self
            .send_or_queue(OperationType::Update, id, Some(data))
            .await?;
        Ok(MutationOutcome {
            value,
            delivery,
            quota_warning,
        })
    }

    /// Returns whether a local copy was removed.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_snippet(&self, id: &str) -> Result<MutationOutcome<bool>> {
        let (removed, quota_warning) = absorb_quota(self.storage.delete_snippet(id).await)?;
        let delivery = self.send_or_queue(OperationType::Delete, id, None).await?;
        Ok(MutationOutcome {
            value: removed.unwrap_or(true),
            delivery,
            quota_warning,
        })
    }

    async fn send_or_queue(
        &self,
        op_type: OperationType,
        id: &str,
        data: Option<serde_json::Value>,
    ) -> Result<Delivery> {
        if self.can_send_directly().await? {
            let result = match (&op_type, &data) {
                (OperationType::Update, Some(data)) => self.remote.update_snippet(id, data).await,
                _ => self.remote.delete_snippet(id).await,
            };
            match result {
                Ok(()) => return Ok(Delivery::Sent),
                Err(RemoteError::NotFound) => {
                    debug!("{:?} for {} found nothing on the server", op_type, id);
                    return Ok(Delivery::Sent);
                }
                Err(e) if self.defer_after(&e) => {
                    warn!("{:?} for {} failed ({}), queueing for later", op_type, id, e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.queue
            .enqueue(op_type, Some(id.to_string()), data)
            .await?;
        Ok(Delivery::Queued)
    }

    /// Bump the client-local usage counter. Never sent to the server.
    pub async fn record_usage(&self, id: &str) -> Result<u64> {
        match absorb_quota(self.storage.increment_usage(id).await)? {
            (Some(count), _) => Ok(count),
            (None, _) => Ok(self
                .storage
                .get_snippet(id)
                .await?
                .map(|s| s.usage_count)
                .unwrap_or_default()),
        }
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub async fn drain_now(&self) -> Result<DrainReport> {
        self.processor.process_sync_queue().await
    }

    /// Push queued mutations, then pull server changes.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        if !self.auth.is_authenticated().await? {
            return Err(SyncError::NotAuthenticated);
        }
        if !self.connectivity.is_online() {
            return Ok(SyncReport {
                snippets: self.storage.get_snippets().await?,
                source: SyncSource::Cached {
                    error: RemoteError::Network("offline".to_string()),
                },
                quota_fallback: false,
            });
        }

        self.drain_now().await?;
        self.reconciler.sync(&self.settings.user_id).await
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain_now().await {
            warn!("Queue drain failed: {}", e);
        }
    }

    async fn sync_logged(&self) {
        match self.sync_now().await {
            Ok(report) => match report.source {
                SyncSource::Cached { error } => warn!("Sync deferred, showing cached data: {}", error),
                source => debug!("Sync finished ({:?}), {} snippets", source, report.snippets.len()),
            },
            Err(SyncError::NotAuthenticated) => debug!("Not signed in, skipping sync"),
            Err(e) if e.is_auth() => warn!("Sync rejected, session expired: {}", e),
            Err(e) => warn!("Sync failed: {}", e),
        }
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Drive periodic drains and syncs until `shutdown` fires.
    ///
    /// On each Online transition the token scheduler is told to retry and a
    /// drain followed by a sync is spawned; neither waits for the other.
    pub async fn run(self: Arc<Self>, tokens: TokenRefreshHandle, mut shutdown: watch::Receiver<bool>) {
        match self.storage.detect_sync_data_loss().await {
            Ok(true) => warn!("Synced snippets were wiped on another device; a backup is available"),
            Ok(false) => {}
            Err(e) => warn!("Could not check for sync data loss: {}", e),
        }

        let mut events = self.connectivity.subscribe();
        let mut drain_tick = tokio::time::interval(self.settings.drain_interval);
        drain_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync_tick = tokio::time::interval(self.settings.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Sync engine running (sync every {}s, drain every {}s)",
            self.settings.sync_interval.as_secs(),
            self.settings.drain_interval.as_secs()
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ConnectivityEvent::Online) => {
                        tokens.connectivity_restored();
                        let engine = self.clone();
                        tokio::spawn(async move {
                            engine.drain_logged().await;
                            engine.sync_logged().await;
                        });
                    }
                    Some(ConnectivityEvent::Offline) => debug!("Offline, mutations will be queued"),
                    None => break,
                },
                _ = drain_tick.tick() => {
                    if self.connectivity.is_online() {
                        self.drain_logged().await;
                    }
                }
                _ = sync_tick.tick() => {
                    if self.connectivity.is_online() {
                        self.sync_logged().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.storage.flush_backups().await;
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::TokenGrant;
    use crate::testing::{memory_storage, FakeRemote};
    use crate::token_refresh::{TokenRefreshScheduler, TokenState};
    use snipsync_core::StorageMode;
    use snipsync_storage::{FilePartition, Partitions};
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<SyncEngine>,
        storage: Arc<StorageManager>,
        queue: Arc<OperationQueue>,
        remote: Arc<FakeRemote>,
        auth: Arc<AuthStore>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    async fn harness(online: bool) -> Harness {
        let (storage, local) = memory_storage();
        let queue = Arc::new(OperationQueue::open(local.clone()).await.unwrap());
        let remote = Arc::new(FakeRemote::new());
        let auth = Arc::new(AuthStore::new(local.clone()));
        auth.store_grant(&TokenGrant {
            access_token: "at".into(),
            expires_in: 3600,
            refresh_token: Some("rt".into()),
        })
        .await
        .unwrap();
        let connectivity = Arc::new(ConnectivityMonitor::new(online));
        let engine = Arc::new(SyncEngine::new(
            storage.clone(),
            queue.clone(),
            remote.clone(),
            auth.clone(),
            connectivity.clone(),
            local,
            EngineSettings::default(),
        ));
        Harness {
            engine,
            storage,
            queue,
            remote,
            auth,
            connectivity,
        }
    }

    #[tokio::test]
    async fn test_online_create_is_sent_and_rekeyed() {
        let h = harness(true).await;
        let outcome = h
            .engine
            .create_snippet(Snippet::new("/hi", "hello"))
            .await
            .unwrap();

        assert_eq!(outcome.delivery, Delivery::Sent);
        assert_eq!(outcome.value.id, "srv-1");
        assert!(h.queue.is_empty().await.unwrap());
        let local = h.storage.get_snippets().await.unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, "srv-1");
    }

    #[tokio::test]
    async fn test_offline_mutations_queue_then_drain_on_reconnect() {
        let h = harness(false).await;
        let created = h
            .engine
            .create_snippet(Snippet::new("/a", "alpha"))
            .await
            .unwrap();
        assert_eq!(created.delivery, Delivery::Queued);

        let updated = h
            .engine
            .update_snippet(
                &created.value.id,
                SnippetUpdate {
                    content: Some("ALPHA".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.delivery, Delivery::Queued);
        assert_eq!(updated.value.content, "ALPHA");
        assert_eq!(h.queue.len().await.unwrap(), 2);
        assert!(h.remote.calls().is_empty());

        h.connectivity.set_online(true);
        let report = h.engine.drain_now().await.unwrap();
        assert_eq!(report.successful, 2);

        let server = h.remote.server_snippets();
        assert_eq!(server.len(), 1);
        assert_eq!(server[0].content, "ALPHA");
        assert_eq!(h.storage.get_snippets().await.unwrap()[0].id, server[0].id);
    }

    #[tokio::test]
    async fn test_pending_queue_forces_new_mutations_behind_it() {
        let h = harness(false).await;
        let s = h
            .engine
            .create_snippet(Snippet::new("/q", "queued"))
            .await
            .unwrap()
            .value;

        h.connectivity.set_online(true);
        let outcome = h.engine.delete_snippet(&s.id).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
        assert!(outcome.value);
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_network_failure_queues_and_marks_offline() {
        let h = harness(true).await;
        let s = Snippet::new("/n", "net");
        h.remote.seed_server(vec![s.clone()]);
        h.storage.save_snippet(s.clone()).await.unwrap();
        h.remote
            .fail_next_mutation(RemoteError::Network("connection reset".into()));

        let outcome = h.engine.delete_snippet(&s.id).await.unwrap();
        assert_eq!(outcome.delivery, Delivery::Queued);
        assert!(!h.connectivity.is_online());
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert!(h.storage.get_snippets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_online_update_of_remote_absent_snippet_counts_as_sent() {
        let h = harness(true).await;
        let s = h.storage.save_snippet(Snippet::new("/x", "x")).await.unwrap();
        let outcome = h
            .engine
            .update_snippet(
                &s.id,
                SnippetUpdate {
                    label: Some("X".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.delivery, Delivery::Sent);
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_surfaced() {
        let h = harness(true).await;
        h.remote
            .fail_next_mutation(RemoteError::BadRequest("shortcut taken".into()));
        let err = h
            .engine
            .create_snippet(Snippet::new("/dup", "dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::BadRequest(_))));
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_quota_fallback_is_reported_once() {
        let h = harness(false).await;
        let big = Snippet::new("/big", "x".repeat(9 * 1024));
        let first = h.engine.create_snippet(big).await.unwrap();
        assert!(first.quota_warning);
        assert_eq!(h.storage.mode().await.unwrap(), StorageMode::Local);

        let second = h
            .engine
            .create_snippet(Snippet::new("/small", "s"))
            .await
            .unwrap();
        assert!(!second.quota_warning);
        assert_eq!(h.storage.get_snippets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_record_usage_stays_local() {
        let h = harness(true).await;
        let s = h.storage.save_snippet(Snippet::new("/u", "u")).await.unwrap();
        assert_eq!(h.engine.record_usage(&s.id).await.unwrap(), 1);
        assert_eq!(h.engine.record_usage(&s.id).await.unwrap(), 2);
        assert!(h.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_sync_now_pushes_then_pulls() {
        let h = harness(false).await;
        h.engine
            .create_snippet(Snippet::new("/mine", "local"))
            .await
            .unwrap();
        h.connectivity.set_online(true);

        let report = h.engine.sync_now().await.unwrap();
        assert!(matches!(report.source, SyncSource::Delta { .. }));
        assert_eq!(
            h.remote.calls(),
            vec!["POST /snippets /mine".to_string(), "GET /snippets/sync".to_string()]
        );
    }

    #[tokio::test]
    async fn test_sync_requires_session_and_serves_cache_offline() {
        let h = harness(false).await;
        let report = h.engine.sync_now().await.unwrap();
        assert!(matches!(report.source, SyncSource::Cached { .. }));

        h.auth.clear().await.unwrap();
        assert!(matches!(
            h.engine.sync_now().await,
            Err(SyncError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_reconnect_drains_syncs_and_notifies_token_scheduler() {
        let h = harness(false).await;
        h.engine
            .create_snippet(Snippet::new("/later", "later"))
            .await
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tokens = TokenRefreshScheduler::spawn(
            h.remote.clone(),
            h.auth.clone(),
            h.connectivity.clone(),
            RefreshPolicy::default(),
            shutdown_rx.clone(),
        );
        let run = tokio::spawn(h.engine.clone().run(tokens.clone(), shutdown_rx));
        // Let the loop subscribe before the transition.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        h.connectivity.set_online(true);
        for _ in 0..200 {
            if h.queue.is_empty().await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.queue.is_empty().await.unwrap());
        assert_eq!(h.remote.server_snippets().len(), 1);
        assert!(matches!(tokens.state(), TokenState::Scheduled { .. }));

        // The periodic sync is minutes away; this pull comes from the reconnect.
        let pulled = || h.remote.calls().iter().any(|c| c == "GET /snippets/sync");
        for _ in 0..200 {
            if pulled() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(pulled());
        let calls = h.remote.calls();
        let pushed = calls.iter().position(|c| c.starts_with("POST /snippets"));
        let pull = calls.iter().position(|c| c == "GET /snippets/sync");
        assert!(pushed < pull);

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_queued_work_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let open = || {
            let local: Arc<dyn Partition> = Arc::new(FilePartition::new(temp_dir.path(), "local"));
            let storage = Arc::new(StorageManager::new(
                Partitions {
                    syncable: Arc::new(FilePartition::new(temp_dir.path(), "sync")),
                    local: local.clone(),
                    backup: Arc::new(FilePartition::new(temp_dir.path(), "backup")),
                },
                QuotaLimits::default(),
            ));
            (storage, local)
        };

        let remote = Arc::new(FakeRemote::new());
        {
            let (storage, local) = open();
            let queue = Arc::new(OperationQueue::open(local.clone()).await.unwrap());
            let engine = SyncEngine::new(
                storage,
                queue,
                remote.clone(),
                Arc::new(AuthStore::new(local.clone())),
                Arc::new(ConnectivityMonitor::new(false)),
                local,
                EngineSettings::default(),
            );
            engine
                .create_snippet(Snippet::new("/persist", "p"))
                .await
                .unwrap();
        }

        let (storage, local) = open();
        let queue = Arc::new(OperationQueue::open(local.clone()).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
        let engine = SyncEngine::new(
            storage.clone(),
            queue,
            remote.clone(),
            Arc::new(AuthStore::new(local.clone())),
            Arc::new(ConnectivityMonitor::new(true)),
            local,
            EngineSettings::default(),
        );
        assert_eq!(engine.drain_now().await.unwrap().successful, 1);
        assert_eq!(storage.get_snippets().await.unwrap()[0].id, "srv-1");
    }
}
