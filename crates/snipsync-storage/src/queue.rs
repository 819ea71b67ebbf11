use std::sync::Arc;

use chrono::Utc;
use snipsync_core::{keys, OperationType, Partition, QueuedOperation, StoreError, SyncQueue};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Durable FIFO of mutations made while offline.
///
/// Lives under `syncQueue` in the local partition so it survives restarts.
/// Any mutation path may append; only the queue processor removes.
pub struct OperationQueue {
    partition: Arc<dyn Partition>,
    lock: Mutex<()>,
}

impl OperationQueue {
    /// Open the queue, clearing a drain guard left set by a process that died mid-drain.
    pub async fn open(partition: Arc<dyn Partition>) -> Result<Self, StoreError> {
        let queue = Self {
            partition,
            lock: Mutex::new(()),
        };
        queue
            .modify(|q| {
                if q.sync_in_progress {
                    warn!("Clearing stale sync-in-progress flag from a previous run");
                    q.sync_in_progress = false;
                }
            })
            .await?;
        Ok(queue)
    }

    async fn load(&self) -> Result<SyncQueue, StoreError> {
        let Some(raw) = self.partition.get(keys::SYNC_QUEUE).await? else {
            return Ok(SyncQueue::default());
        };
        match serde_json::from_str(&raw) {
            Ok(queue) => Ok(queue),
            Err(e) => {
                warn!("Corrupt sync queue, starting empty: {}", e);
                Ok(SyncQueue::default())
            }
        }
    }

    async fn store(&self, queue: &SyncQueue) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(queue)?;
        self.partition.set(keys::SYNC_QUEUE, &serialized).await
    }

    /// Read-modify-write under the queue lock.
    async fn modify<R>(&self, f: impl FnOnce(&mut SyncQueue) -> R) -> Result<R, StoreError> {
        let _guard = self.lock.lock().await;
        let mut queue = self.load().await?;
        let result = f(&mut queue);
        self.store(&queue).await?;
        Ok(result)
    }

    /// Append a new operation at the tail.
    #[instrument(skip(self, data), level = "debug")]
    pub async fn enqueue(
        &self,
        op_type: OperationType,
        snippet_id: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Result<QueuedOperation, StoreError> {
        let op = QueuedOperation::new(op_type, snippet_id, data);
        self.push(op.clone()).await?;
        Ok(op)
    }

    pub async fn push(&self, op: QueuedOperation) -> Result<(), StoreError> {
        let id = op.id.clone();
        let len = self.modify(|q| {
            q.operations.push(op);
            q.operations.len()
        })
        .await?;
        debug!("Queued operation {} ({} pending)", id, len);
        Ok(())
    }

    /// Pending operations in submission order.
    pub async fn pending(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.operations)
    }

    pub async fn snapshot(&self) -> Result<SyncQueue, StoreError> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.pending().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    /// Remove an operation. Returns whether it was present.
    pub async fn remove(&self, op_id: &str) -> Result<bool, StoreError> {
        self.modify(|q| {
            let before = q.operations.len();
            q.operations.retain(|op| op.id != op_id);
            q.operations.len() != before
        })
        .await
    }

    /// Bump an operation's retry counter. Returns the new count, or `None` if it is gone.
    pub async fn record_failure(&self, op_id: &str, error: &str) -> Result<Option<u32>, StoreError> {
        self.modify(|q| {
            q.operations.iter_mut().find(|op| op.id == op_id).map(|op| {
                op.retries += 1;
                op.last_error = Some(error.to_string());
                op.retries
            })
        })
        .await
    }

    /// Point queued operations at a server-assigned id. Returns how many changed.
    pub async fn remap_snippet_id(&self, old_id: &str, new_id: &str) -> Result<usize, StoreError> {
        let changed = self
            .modify(|q| {
                let mut changed = 0;
                for op in q.operations.iter_mut() {
                    if op.snippet_id.as_deref() == Some(old_id) {
                        op.snippet_id = Some(new_id.to_string());
                        if let Some(serde_json::Value::Object(map)) = op.data.as_mut() {
                            if map.contains_key("id") {
                                map.insert("id".to_string(), new_id.into());
                            }
                        }
                        changed += 1;
                    }
                }
                changed
            })
            .await?;
        if changed > 0 {
            debug!("Remapped {} queued operations from {} to {}", changed, old_id, new_id);
        }
        Ok(changed)
    }

    /// Set the drain guard. Returns `false` if a drain is already running.
    pub async fn try_begin_drain(&self) -> Result<bool, StoreError> {
        self.modify(|q| {
            if q.sync_in_progress {
                false
            } else {
                q.sync_in_progress = true;
                true
            }
        })
        .await
    }

    /// Clear the drain guard and stamp `last_sync_at`.
    pub async fn finish_drain(&self) -> Result<(), StoreError> {
        self.modify(|q| {
            q.sync_in_progress = false;
            q.last_sync_at = Some(Utc::now());
        })
        .await
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.modify(|q| q.operations.clear()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{FilePartition, MemoryPartition};
    use serde_json::json;
    use tempfile::TempDir;

    async fn queue() -> OperationQueue {
        OperationQueue::open(Arc::new(MemoryPartition::new("local")))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = queue().await;
        let a = queue
            .enqueue(OperationType::Create, Some("a".into()), Some(json!({"id": "a"})))
            .await
            .unwrap();
        let b = queue
            .enqueue(OperationType::Update, Some("a".into()), Some(json!({"content": "x"})))
            .await
            .unwrap();
        let c = queue
            .enqueue(OperationType::Delete, Some("b".into()), None)
            .await
            .unwrap();

        let ids: Vec<String> = queue.pending().await.unwrap().into_iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![a.id.clone(), b.id, c.id]);

        assert!(queue.remove(&a.id).await.unwrap());
        assert!(!queue.remove(&a.id).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_record_failure_counts_retries() {
        let queue = queue().await;
        let op = queue.enqueue(OperationType::Delete, Some("x".into()), None).await.unwrap();

        assert_eq!(queue.record_failure(&op.id, "timeout").await.unwrap(), Some(1));
        assert_eq!(queue.record_failure(&op.id, "503").await.unwrap(), Some(2));
        assert_eq!(queue.record_failure("missing", "x").await.unwrap(), None);

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending[0].retries, 2);
        assert_eq!(pending[0].last_error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn test_drain_guard() {
        let queue = queue().await;
        assert!(queue.try_begin_drain().await.unwrap());
        assert!(!queue.try_begin_drain().await.unwrap());

        queue.finish_drain().await.unwrap();
        let snapshot = queue.snapshot().await.unwrap();
        assert!(!snapshot.sync_in_progress);
        assert!(snapshot.last_sync_at.is_some());
        assert!(queue.try_begin_drain().await.unwrap());
    }

    #[tokio::test]
    async fn test_remap_snippet_id() {
        let queue = queue().await;
        queue
            .enqueue(OperationType::Create, Some("tmp".into()), Some(json!({"id": "tmp"})))
            .await
            .unwrap();
        queue
            .enqueue(OperationType::Update, Some("tmp".into()), Some(json!({"content": "y"})))
            .await
            .unwrap();
        queue
            .enqueue(OperationType::Delete, Some("other".into()), None)
            .await
            .unwrap();

        assert_eq!(queue.remap_snippet_id("tmp", "55").await.unwrap(), 2);
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending[0].snippet_id.as_deref(), Some("55"));
        assert_eq!(pending[0].data.as_ref().unwrap()["id"], "55");
        assert_eq!(pending[1].snippet_id.as_deref(), Some("55"));
        assert!(pending[1].data.as_ref().unwrap().get("id").is_none());
        assert_eq!(pending[2].snippet_id.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_queue_survives_restart_and_stale_guard_is_cleared() {
        let temp_dir = TempDir::new().unwrap();
        {
            let queue = OperationQueue::open(Arc::new(FilePartition::new(temp_dir.path(), "local")))
                .await
                .unwrap();
            queue.enqueue(OperationType::Delete, Some("9".into()), None).await.unwrap();
            assert!(queue.try_begin_drain().await.unwrap());
            // process dies here
        }

        let queue = OperationQueue::open(Arc::new(FilePartition::new(temp_dir.path(), "local")))
            .await
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
        assert!(!queue.snapshot().await.unwrap().sync_in_progress);
    }

    #[tokio::test]
    async fn test_corrupt_queue_reads_as_empty() {
        let partition = Arc::new(MemoryPartition::new("local"));
        partition.set(keys::SYNC_QUEUE, "[oops").await.unwrap();
        let queue = OperationQueue::open(partition).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }
}
