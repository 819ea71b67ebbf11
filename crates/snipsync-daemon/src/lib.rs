//! Sync side of snipsync: talks to the snippet service and keeps the local
//! store eventually consistent with it.
//!
//! - `SyncQueueProcessor`: drains mutations queued while offline, in order
//! - `IncrementalSyncReconciler`: pulls `updated_since` deltas, falls back to a full list
//! - `TokenRefreshScheduler`: refreshes the access token before it expires
//! - `ConnectivityMonitor`: online/offline transitions that trigger the above
//! - `SyncEngine`: wires everything together for the daemon binary

pub mod auth;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod http;
pub mod reconcile;
pub mod remote;
pub mod sync_queue;
pub mod token_refresh;

#[cfg(test)]
mod testing;

pub use auth::AuthStore;
pub use config::Config;
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivityProbe, Subscription};
pub use engine::{Delivery, EngineSettings, MutationOutcome, SyncEngine};
pub use error::{RemoteError, SyncError};
pub use http::HttpRemote;
pub use reconcile::{apply_delta, IncrementalSyncReconciler, RetryPolicy, SyncReport, SyncSource};
pub use remote::{RemoteApi, TokenGrant};
pub use sync_queue::{DrainReport, SyncQueueProcessor};
pub use token_refresh::{
    RefreshMachine, RefreshPolicy, TokenRefreshHandle, TokenRefreshScheduler, TokenState,
};
