mod backup;
mod local;
mod syncable;

pub use backup::BackupBackend;
pub use local::LocalBackend;
pub use syncable::{QuotaLimits, SyncableBackend};

use snipsync_core::Snippet;
use tracing::warn;

/// Decode a stored snippet array. Corrupt data is treated as absence.
pub(crate) fn decode_list(partition: &str, key: &str, raw: Option<String>) -> Vec<Snippet> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str(&raw) {
        Ok(list) => list,
        Err(e) => {
            warn!(
                "Corrupt snippet data under '{}' in partition {}, treating as empty: {}",
                key, partition, e
            );
            Vec::new()
        }
    }
}
