use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A text snippet.
///
/// The core treats a snippet list as an unordered collection keyed by `id`.
/// Shortcut uniqueness is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snippet {
    /// Server-assigned, or a client-generated UUID for items created offline.
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Trigger string typed by the user.
    pub shortcut: String,
    /// Opaque body text.
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Client-local expansion counter. Never decreases.
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snippet {
    /// Create a snippet with a fresh client-side id.
    pub fn new(shortcut: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: String::new(),
            shortcut: shortcut.into(),
            content: content.into(),
            tags: BTreeSet::new(),
            usage_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Partial update of a snippet's user-editable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnippetUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shortcut: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

impl SnippetUpdate {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.shortcut.is_none()
            && self.content.is_none()
            && self.tags.is_none()
    }

    /// Apply the present fields and bump `updated_at`.
    pub fn apply(&self, snippet: &mut Snippet) {
        if let Some(label) = &self.label {
            snippet.label = label.clone();
        }
        if let Some(shortcut) = &self.shortcut {
            snippet.shortcut = shortcut.clone();
        }
        if let Some(content) = &self.content {
            snippet.content = content.clone();
        }
        if let Some(tags) = &self.tags {
            snippet.tags = tags.clone();
        }
        snippet.updated_at = Utc::now();
    }
}

/// Which backend currently holds the canonical snippet list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    #[default]
    Sync,
    Local,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Sync => "sync",
            StorageMode::Local => "local",
        }
    }

    /// Parse a persisted flag. Anything unrecognised means the default.
    pub fn parse(value: &str) -> Self {
        match value.trim().trim_matches('"') {
            "local" => StorageMode::Local,
            _ => StorageMode::Sync,
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived storage status. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub mode: StorageMode,
    pub quota_exceeded: bool,
}

impl From<StorageMode> for StorageStatus {
    fn from(mode: StorageMode) -> Self {
        Self {
            mode,
            quota_exceeded: mode == StorageMode::Local,
        }
    }
}

/// Full copy of the snippet list kept for disaster recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSnapshot {
    pub snippets: Vec<Snippet>,
    pub saved_at: DateTime<Utc>,
}
