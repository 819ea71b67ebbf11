//! Best-effort shadow backup writes.
//!
//! Snapshots are handed to a background task over a bounded channel. Delivery
//! is at-most-once: when the channel is full the snapshot is dropped, and a
//! failed write is logged and never retried. A later snapshot supersedes it.

use std::sync::Arc;

use snipsync_core::{Snippet, SnippetBackend};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 16;

enum ShadowJob {
    Write(Vec<Snippet>),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background shadow-write task.
///
/// Must be created inside a tokio runtime. The task exits once every handle is dropped.
#[derive(Clone)]
pub struct ShadowWriter {
    tx: mpsc::Sender<ShadowJob>,
}

impl ShadowWriter {
    pub fn spawn(backend: Arc<dyn SnippetBackend>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(run(backend, rx));
        Self { tx }
    }

    /// Queue a snapshot. Never blocks and never fails the caller.
    pub fn submit(&self, snippets: Vec<Snippet>) {
        match self.tx.try_send(ShadowJob::Write(snippets)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Shadow backup channel full, dropping snapshot");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Shadow backup writer stopped, dropping snapshot");
            }
        }
    }

    /// Wait until every snapshot submitted before this call has been handled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ShadowJob::Flush(ack_tx)).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run(backend: Arc<dyn SnippetBackend>, mut rx: mpsc::Receiver<ShadowJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            ShadowJob::Write(snippets) => {
                if let Err(e) = backend.save_snippets(&snippets).await {
                    warn!("Shadow backup to {} failed: {}", backend.name(), e);
                } else {
                    debug!("Shadow backup of {} snippets written", snippets.len());
                }
            }
            ShadowJob::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Shadow backup writer stopped");
}
