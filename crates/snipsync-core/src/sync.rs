use serde::{Deserialize, Serialize};

use crate::model::Snippet;

/// Reference to a snippet deleted on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRef {
    pub id: String,
}

/// Changes reported by `GET /snippets/sync?updated_since=...`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    #[serde(default)]
    pub created: Vec<Snippet>,
    #[serde(default)]
    pub updated: Vec<Snippet>,
    #[serde(default)]
    pub deleted: Vec<DeletedRef>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }
}

/// Full list returned by `GET /snippets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnippetPage {
    #[serde(default)]
    pub data: Vec<Snippet>,
    #[serde(default)]
    pub count: usize,
}
