use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use snipsync_core::Partition;
use snipsync_storage::{FilePartition, OperationQueue, Partitions, StorageManager};
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snipsync_daemon::{
    AuthStore, Config, ConnectivityMonitor, ConnectivityProbe, HttpRemote, RemoteApi, SyncEngine,
    TokenRefreshScheduler,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.engine_settings();
    let data_dir = config.data_dir();

    info!("Starting snipsync-daemon");
    info!("  Data dir: {}", data_dir.display());
    info!("  API: {}", config.api_url);
    info!("  User: {}", settings.user_id);

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data dir {}", data_dir.display()))?;

    // Partitions
    let local: Arc<dyn Partition> = Arc::new(FilePartition::new(&data_dir, "local"));
    let partitions = Partitions {
        syncable: Arc::new(FilePartition::new(&data_dir, "sync")),
        local: local.clone(),
        backup: Arc::new(FilePartition::new(&data_dir, "backup")),
    };

    let storage = Arc::new(StorageManager::new(partitions, settings.quota));
    info!("  Storage mode: {}", storage.mode().await?);

    let queue = Arc::new(OperationQueue::open(local.clone()).await?);
    info!("  Queued operations: {}", queue.len().await?);

    let auth = Arc::new(AuthStore::new(local.clone()));
    let remote: Arc<dyn RemoteApi> = Arc::new(
        HttpRemote::new(config.api_url.clone(), auth.clone(), settings.request_timeout)
            .context("Failed to create HTTP client")?,
    );

    let shutdown_rx = create_shutdown_signal();

    // Start offline; the first probe decides.
    let connectivity = Arc::new(ConnectivityMonitor::new(false));
    let probe = ConnectivityProbe::new(remote.clone(), connectivity.clone(), settings.probe_interval);
    let probe_task = tokio::spawn(probe.run(shutdown_rx.clone()));

    let tokens = TokenRefreshScheduler::spawn(
        remote.clone(),
        auth.clone(),
        connectivity.clone(),
        settings.refresh,
        shutdown_rx.clone(),
    );

    let engine = Arc::new(SyncEngine::new(
        storage,
        queue,
        remote,
        auth,
        connectivity,
        local,
        settings,
    ));
    let engine_task = tokio::spawn(engine.run(tokens, shutdown_rx));

    for result in futures::future::join_all([probe_task, engine_task]).await {
        result.context("Background task panicked")?;
    }

    info!("Daemon shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
