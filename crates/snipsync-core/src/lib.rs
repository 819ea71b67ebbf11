//! Core traits and types for the snipsync storage and sync engine.
//!
//! This crate defines the abstractions shared by the storage layer and the sync daemon:
//! - `Partition`: a key-value store addressed by string keys (syncable, local, backup)
//! - `SnippetBackend`: read/write/clear of the full snippet collection over one partition
//! - `Snippet`, `SnippetUpdate`: the unit of user data
//! - `QueuedOperation`, `SyncQueue`: durable offline mutations
//! - `SyncDelta`, `SnippetPage`: remote reconciliation payloads

mod backend;
mod error;
pub mod keys;
mod model;
mod partition;
mod queue;
mod sync;

pub use backend::SnippetBackend;
pub use error::{QuotaViolation, StoreError};
pub use model::{BackupSnapshot, Snippet, SnippetUpdate, StorageMode, StorageStatus};
pub use partition::Partition;
pub use queue::{OperationType, QueuedOperation, SyncQueue};
pub use sync::{DeletedRef, SnippetPage, SyncDelta};
