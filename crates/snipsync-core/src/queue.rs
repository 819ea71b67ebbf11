use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of remote mutation captured while offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// A durable intent to mutate server state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    /// Required for update and delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    pub fn new(
        op_type: OperationType,
        snippet_id: Option<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            op_type,
            snippet_id,
            data,
            created_at: Utc::now(),
            retries: 0,
            last_error: None,
        }
    }
}

/// The single per-installation queue of pending operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueue {
    #[serde(default)]
    pub operations: Vec<QueuedOperation>,
    /// Guard against concurrent drains.
    #[serde(default)]
    pub sync_in_progress: bool,
    #[serde(default)]
    pub last_sync_at: Option<DateTime<Utc>>,
}
