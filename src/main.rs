use anyhow::{Context, Result};
use dist_storage::{DistributedStorageManager, StorageConfig, TracingTelemetry};
use std::{fs, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = StorageConfig::from_env_and_args()?;

    tracing::info!("Starting dist-storage with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !cfg.base_path.exists() {
        fs::create_dir_all(&cfg.base_path)
            .with_context(|| format!("creating {}", cfg.base_path.display()))?;
        tracing::info!("Created storage directory at {}", cfg.base_path.display());
    }

    let manager = DistributedStorageManager::new(cfg)
        .await
        .context("building storage manager")?
        .with_telemetry(Arc::new(TracingTelemetry));

    // --- Handle migration mode ---
    if migrate {
        manager.metadata_store().migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    manager.initialize().await.context("initializing storage manager")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    manager.shutdown().await;
    let metrics = manager.get_metrics();
    tracing::info!(
        objects = metrics.total_objects,
        bytes = metrics.total_bytes,
        failed = metrics.failed_operations,
        "final metrics"
    );
    Ok(())
}
