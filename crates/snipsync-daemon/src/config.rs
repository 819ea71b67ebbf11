use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use snipsync_storage::QuotaLimits;

use crate::engine::EngineSettings;

/// Configuration for the snipsync daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "snipsync-daemon")]
#[command(about = "Offline-first snippet storage and sync daemon")]
pub struct Config {
    /// Directory holding the sync, local and backup partitions
    #[arg(long, env = "SNIPSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the snippet service
    #[arg(long, env = "SNIPSYNC_API_URL")]
    pub api_url: String,

    /// User the sync checkpoint belongs to
    #[arg(long, default_value = "default", env = "SNIPSYNC_USER_ID")]
    pub user_id: String,

    /// Per-request timeout (seconds)
    #[arg(long, default_value = "30", env = "SNIPSYNC_REQUEST_TIMEOUT")]
    pub request_timeout_secs: u64,

    /// Interval between incremental syncs (seconds)
    #[arg(long, default_value = "300", env = "SNIPSYNC_SYNC_INTERVAL")]
    pub sync_interval_secs: u64,

    /// Interval between queue drains while online (seconds)
    #[arg(long, default_value = "60", env = "SNIPSYNC_DRAIN_INTERVAL")]
    pub drain_interval_secs: u64,

    /// Interval between reachability probes (seconds)
    #[arg(long, default_value = "30", env = "SNIPSYNC_PROBE_INTERVAL")]
    pub probe_interval_secs: u64,

    /// Drop a queued operation after this many failed attempts (unbounded if unset)
    #[arg(long, env = "SNIPSYNC_MAX_OPERATION_RETRIES")]
    pub max_operation_retries: Option<u32>,

    /// Total byte quota of the syncable partition
    #[arg(long, default_value = "102400", env = "SNIPSYNC_SYNC_QUOTA_BYTES")]
    pub sync_quota_bytes: usize,

    /// Byte quota per syncable item
    #[arg(long, default_value = "8192", env = "SNIPSYNC_SYNC_QUOTA_BYTES_PER_ITEM")]
    pub sync_quota_bytes_per_item: usize,

    /// Maximum number of syncable items
    #[arg(long, default_value = "512", env = "SNIPSYNC_SYNC_MAX_ITEMS")]
    pub sync_max_items: usize,
}

impl Config {
    /// Configured data directory, or the platform data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("snipsync")
        })
    }

    pub fn quota(&self) -> QuotaLimits {
        QuotaLimits {
            total_bytes: self.sync_quota_bytes,
            bytes_per_item: self.sync_quota_bytes_per_item,
            max_items: self.sync_max_items,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            user_id: self.user_id.clone(),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            drain_interval: Duration::from_secs(self.drain_interval_secs),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            max_operation_retries: self.max_operation_retries,
            quota: self.quota(),
            ..Default::default()
        }
    }
}
