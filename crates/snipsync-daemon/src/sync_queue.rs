//! Drains the offline operation queue against the remote service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use snipsync_core::{OperationType, QueuedOperation, Snippet, StoreError};
use snipsync_storage::{OperationQueue, StorageManager};
use tracing::{debug, info, instrument, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, Result};
use crate::remote::RemoteApi;

/// Counts from one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Sent, or already gone on the server (404 on update/delete).
    pub successful: usize,
    /// Left in the queue for the next pass.
    pub failed: usize,
    /// Dropped: retry cap reached, or the operation was malformed.
    pub abandoned: usize,
    /// Not attempted because an earlier operation on the same snippet failed.
    pub deferred: usize,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        *self == DrainReport::default()
    }
}

/// What a successful remote call did.
enum Applied {
    Sent,
    AlreadyGone,
    Created { client_id: Option<String>, snippet: Snippet },
}

/// Sends queued mutations to the remote service, strictly in submission order.
pub struct SyncQueueProcessor {
    queue: Arc<OperationQueue>,
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Arc<ConnectivityMonitor>,
    max_retries: Option<u32>,
}

impl SyncQueueProcessor {
    pub fn new(
        queue: Arc<OperationQueue>,
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            queue,
            storage,
            remote,
            connectivity,
            max_retries: None,
        }
    }

    /// Drop an operation once its retry counter reaches `max`. `None` retries forever.
    pub fn with_max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    /// Run one drain pass.
    ///
    /// Returns zero counts when offline or when another drain holds the guard.
    /// The guard is always released and `last_sync_at` stamped, even if the
    /// pass stops early.
    #[instrument(skip(self), level = "debug")]
    pub async fn process_sync_queue(&self) -> Result<DrainReport> {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping queue drain");
            return Ok(DrainReport::default());
        }
        if !self.queue.try_begin_drain().await? {
            debug!("Queue drain already in progress");
            return Ok(DrainReport::default());
        }

        let result = self.drain().await;
        let finished = self.queue.finish_drain().await;
        let report = result?;
        finished?;

        if !report.is_empty() {
            info!(
                "Queue drain finished: {} successful, {} failed, {} abandoned, {} deferred",
                report.successful, report.failed, report.abandoned, report.deferred
            );
        }
        Ok(report)
    }

    async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let pending = self.queue.pending().await?;
        if pending.is_empty() {
            return Ok(report);
        }
        info!("Draining {} queued operations", pending.len());

        // Ids re-keyed earlier in this pass, and ids whose operation failed.
        let mut remapped: HashMap<String, String> = HashMap::new();
        let mut blocked: HashSet<String> = HashSet::new();

        for op in pending {
            let snippet_id = op
                .snippet_id
                .as_ref()
                .map(|id| remapped.get(id).cloned().unwrap_or_else(|| id.clone()));

            if let Some(id) = &snippet_id {
                if blocked.contains(id) {
                    debug!("Deferring operation {} behind a failed one on {}", op.id, id);
                    report.deferred += 1;
                    continue;
                }
            }

            if !Self::is_well_formed(&op) {
                warn!("Dropping malformed {:?} operation {}", op.op_type, op.id);
                self.queue.remove(&op.id).await?;
                report.abandoned += 1;
                continue;
            }

            match self.send(&op, snippet_id.as_deref()).await {
                Ok(applied) => {
                    if let Applied::Created { client_id, snippet } = applied {
                        if let Some(client_id) = client_id {
                            if client_id != snippet.id {
                                self.adopt_server_id(&client_id, snippet, &mut remapped)
                                    .await?;
                            }
                        }
                    }
                    self.queue.remove(&op.id).await?;
                    report.successful += 1;
                }
                Err(e) if e.is_auth() => {
                    warn!("Queue drain stopped: {}", e);
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    let retries = self.queue.record_failure(&op.id, &e.to_string()).await?;
                    match (self.max_retries, retries) {
                        (Some(max), Some(retries)) if retries >= max => {
                            warn!(
                                "Abandoning operation {} after {} attempts: {}",
                                op.id, retries, e
                            );
                            self.queue.remove(&op.id).await?;
                            report.abandoned += 1;
                        }
                        _ => {
                            debug!("Operation {} failed, keeping it queued: {}", op.id, e);
                            report.failed += 1;
                            if let Some(id) = snippet_id {
                                blocked.insert(id);
                            }
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    fn is_well_formed(op: &QueuedOperation) -> bool {
        match op.op_type {
            OperationType::Create => op.data.is_some(),
            OperationType::Update => op.snippet_id.is_some() && op.data.is_some(),
            OperationType::Delete => op.snippet_id.is_some(),
        }
    }

    async fn send(
        &self,
        op: &QueuedOperation,
        snippet_id: Option<&str>,
    ) -> std::result::Result<Applied, RemoteError> {
        let empty = serde_json::Value::Null;
        let data = op.data.as_ref().unwrap_or(&empty);
        let id = snippet_id.unwrap_or_default();

        let result = match op.op_type {
            OperationType::Create => {
                let snippet = self.remote.create_snippet(data).await?;
                let client_id = snippet_id.map(str::to_string).or_else(|| {
                    data.get("id").and_then(|v| v.as_str()).map(str::to_string)
                });
                return Ok(Applied::Created { client_id, snippet });
            }
            OperationType::Update => self.remote.update_snippet(id, data).await,
            OperationType::Delete => self.remote.delete_snippet(id).await,
        };

        match result {
            Ok(()) => {
                debug!("Sent {:?} for {}", op.op_type, id);
                Ok(Applied::Sent)
            }
            Err(RemoteError::NotFound) => {
                debug!("{:?} for {} found nothing on the server, dropping", op.op_type, id);
                Ok(Applied::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-key the local copy and every later queued operation to the server id.
    async fn adopt_server_id(
        &self,
        client_id: &str,
        snippet: Snippet,
        remapped: &mut HashMap<String, String>,
    ) -> Result<()> {
        let server_id = snippet.id.clone();
        if self.storage.get_snippet(client_id).await?.is_some() {
            match self.storage.replace_snippet(client_id, snippet).await {
                Ok(()) => {}
                Err(StoreError::QuotaExceeded(violation)) => {
                    warn!("Re-keyed snippet stored locally after quota fallback: {}", violation);
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.queue.remap_snippet_id(client_id, &server_id).await?;
        remapped.insert(client_id.to_string(), server_id.clone());
        debug!("Snippet {} is now {} on the server", client_id, server_id);
        Ok(())
    }
}
