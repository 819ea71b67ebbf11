//! In-memory remote service for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snipsync_core::{Snippet, SnippetUpdate, SyncDelta};
use snipsync_storage::{MemoryPartition, Partitions, QuotaLimits, StorageManager};

use crate::error::RemoteError;
use crate::remote::{RemoteApi, TokenGrant};

/// Records every call in order and serves a tiny server-side snippet table.
pub(crate) struct FakeRemote {
    calls: Mutex<Vec<String>>,
    server: Mutex<Vec<Snippet>>,
    next_failures: Mutex<VecDeque<RemoteError>>,
    sticky_failure: Mutex<Option<RemoteError>>,
    delta_results: Mutex<VecDeque<Result<SyncDelta, RemoteError>>>,
    delta_requests: Mutex<Vec<DateTime<Utc>>>,
    refresh_result: Mutex<Result<TokenGrant, RemoteError>>,
    refresh_calls: AtomicUsize,
    ping_result: Mutex<Result<(), RemoteError>>,
    next_id: AtomicU64,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            server: Mutex::new(Vec::new()),
            next_failures: Mutex::new(VecDeque::new()),
            sticky_failure: Mutex::new(None),
            delta_results: Mutex::new(VecDeque::new()),
            delta_requests: Mutex::new(Vec::new()),
            refresh_result: Mutex::new(Ok(TokenGrant {
                access_token: "refreshed".to_string(),
                expires_in: 3600,
                refresh_token: None,
            })),
            refresh_calls: AtomicUsize::new(0),
            ping_result: Mutex::new(Ok(())),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn server_snippets(&self) -> Vec<Snippet> {
        self.server.lock().unwrap().clone()
    }

    pub(crate) fn seed_server(&self, snippets: Vec<Snippet>) {
        *self.server.lock().unwrap() = snippets;
    }

    /// Fail the next create/update/delete with `error`.
    pub(crate) fn fail_next_mutation(&self, error: RemoteError) {
        self.next_failures.lock().unwrap().push_back(error);
    }

    /// Fail every create/update/delete until cleared.
    pub(crate) fn fail_all_mutations(&self, error: Option<RemoteError>) {
        *self.sticky_failure.lock().unwrap() = error;
    }

    pub(crate) fn push_delta_result(&self, result: Result<SyncDelta, RemoteError>) {
        self.delta_results.lock().unwrap().push_back(result);
    }

    pub(crate) fn delta_requests(&self) -> Vec<DateTime<Utc>> {
        self.delta_requests.lock().unwrap().clone()
    }

    pub(crate) fn set_refresh_result(&self, result: Result<TokenGrant, RemoteError>) {
        *self.refresh_result.lock().unwrap() = result;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ping_result(&self, result: Result<(), RemoteError>) {
        *self.ping_result.lock().unwrap() = result;
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(&self) -> Option<RemoteError> {
        if let Some(e) = self.next_failures.lock().unwrap().pop_front() {
            return Some(e);
        }
        self.sticky_failure.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn fetch_delta(&self, since: DateTime<Utc>) -> Result<SyncDelta, RemoteError> {
        self.record("GET /snippets/sync".to_string());
        self.delta_requests.lock().unwrap().push(since);
        self.delta_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SyncDelta::default()))
    }

    async fn fetch_all(&self) -> Result<Vec<Snippet>, RemoteError> {
        self.record("GET /snippets".to_string());
        Ok(self.server_snippets())
    }

    async fn create_snippet(&self, data: &serde_json::Value) -> Result<Snippet, RemoteError> {
        let mut snippet: Snippet = serde_json::from_value(data.clone())
            .map_err(|e| RemoteError::BadRequest(e.to_string()))?;
        self.record(format!("POST /snippets {}", snippet.shortcut));
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        snippet.id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.server.lock().unwrap().push(snippet.clone());
        Ok(snippet)
    }

    async fn update_snippet(&self, id: &str, data: &serde_json::Value) -> Result<(), RemoteError> {
        self.record(format!("PUT /snippets/{}", id));
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let update: SnippetUpdate = serde_json::from_value(data.clone())
            .map_err(|e| RemoteError::BadRequest(e.to_string()))?;
        let mut server = self.server.lock().unwrap();
        let snippet = server
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(RemoteError::NotFound)?;
        update.apply(snippet);
        Ok(())
    }

    async fn delete_snippet(&self, id: &str) -> Result<(), RemoteError> {
        self.record(format!("DELETE /snippets/{}", id));
        if let Some(e) = self.take_failure() {
            return Err(e);
        }
        let mut server = self.server.lock().unwrap();
        let before = server.len();
        server.retain(|s| s.id != id);
        if server.len() == before {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    async fn refresh_token(&self) -> Result<TokenGrant, RemoteError> {
        self.record("POST /auth/refresh".to_string());
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_result.lock().unwrap().clone()
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.ping_result.lock().unwrap().clone()
    }
}

/// Storage manager over in-memory partitions, plus the local partition.
pub(crate) fn memory_storage() -> (Arc<StorageManager>, Arc<MemoryPartition>) {
    let local = Arc::new(MemoryPartition::new("local"));
    let storage = StorageManager::new(
        Partitions {
            syncable: Arc::new(MemoryPartition::new("sync")),
            local: local.clone(),
            backup: Arc::new(MemoryPartition::new("backup")),
        },
        QuotaLimits::default(),
    );
    (Arc::new(storage), local)
}
