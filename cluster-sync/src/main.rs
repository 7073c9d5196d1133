use anyhow::{Context, Result};
use cluster_sync::SyncManager;
use std::sync::Arc;
use tokensync::config::Config;
use tokensync::directory::RecordDirectory;
use tokensync::hashers::HashRegistry;
use tokensync::store::{RecordStore, SqliteRecordStore};
use tokensync::tokens::SystemTokenStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_sync=info,tokensync=info".into()),
        )
        .init();

    info!("Cluster sync starting...");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        store = %config.store.path,
        clusters = config.sync.clusters.len(),
        token_hashing_required = config.sync.token_hashing_required,
        "Configuration loaded"
    );

    let upstream: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::open(&config.store.path).context("Failed to open upstream store")?,
    );
    let directory = Arc::new(RecordDirectory::new(Arc::clone(&upstream)));
    let hashers = HashRegistry::new(&config.hashing).context("Invalid hashing configuration")?;
    let tokens = Arc::new(SystemTokenStore::new(
        Arc::clone(&upstream),
        directory,
        hashers,
        config.tokens.clone(),
    ));

    let manager = SyncManager::new(tokens, upstream, config.sync.clone());
    let started = manager.start().await?;
    info!(clusters_started = started, "Sync manager started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!("Cluster sync stopped");

    Ok(())
}
