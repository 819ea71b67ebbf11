//! Storage layer for snipsync.
//!
//! Three partitions sit underneath everything:
//! - syncable: small quota, replicated across a user's devices by the host
//! - local: unbounded, private to one device (also holds settings and the queue)
//! - backup: larger store used only for shadow copies
//!
//! `StorageManager` is the single entry point for snippet reads and writes and
//! owns the sync-to-local quota fallback. `OperationQueue` records mutations
//! made while offline.

pub mod backend;
pub mod manager;
pub mod partition;
pub mod queue;
mod shadow;

pub use backend::{BackupBackend, LocalBackend, QuotaLimits, SyncableBackend};
pub use manager::{Partitions, StorageManager};
pub use partition::{FilePartition, MemoryPartition};
pub use queue::OperationQueue;
pub use shadow::ShadowWriter;
