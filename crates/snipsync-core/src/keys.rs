//! Partition keys shared by every execution context.

/// Canonical snippet list (syncable index, or full array in the local partition).
pub const SNIPPETS: &str = "snippets";
/// Per-snippet entry prefix in the syncable partition.
pub const SNIPPET_ITEM_PREFIX: &str = "snippet:";
/// Read mirror consumed by the page-side expander.
pub const CACHED_SNIPPETS: &str = "cachedSnippets";
/// `"sync"` or `"local"`.
pub const STORAGE_MODE: &str = "storageMode";
pub const SYNC_QUEUE: &str = "syncQueue";
pub const LAST_SYNC_AT: &str = "lastSyncAt";
pub const LAST_SYNC_USER_ID: &str = "lastSyncUserId";
pub const TOKEN_EXPIRES_AT: &str = "tokenExpiresAt";
pub const ACCESS_TOKEN: &str = "accessToken";
pub const REFRESH_TOKEN: &str = "refreshToken";
pub const SNIPPETS_BACKUP: &str = "snippetsBackup";
pub const SYNC_DATA_LOST: &str = "syncDataLost";

/// Key of a single snippet in the syncable partition.
pub fn snippet_item(id: &str) -> String {
    format!("{}{}", SNIPPET_ITEM_PREFIX, id)
}
