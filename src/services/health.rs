//! Periodic backend health probing. Results are observability data only;
//! nothing fails over because of them.

use super::storage_manager::DistributedStorageManager;
use crate::services::collaborators::attrs;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

impl DistributedStorageManager {
    /// Probe every backend concurrently and record the results in the
    /// metrics and the telemetry sink.
    pub async fn check_backend_health(&self) -> BTreeMap<String, bool> {
        let results = join_all(self.backends().map(|backend| async move {
            let healthy = self
                .bounded(backend.id(), "health_check", backend.health_check(), false)
                .await;
            (backend.id().to_string(), healthy)
        }))
        .await;

        {
            let mut metrics = self.metrics.lock();
            for (id, healthy) in &results {
                metrics.backend_health.insert(id.clone(), *healthy);
            }
            metrics.last_health_check = Some(Utc::now());
        }

        for (id, healthy) in &results {
            if !healthy {
                warn!(backend = %id, "backend unhealthy");
            }
            self.telemetry.record_metric(
                "storage.backend.health",
                if *healthy { 1.0 } else { 0.0 },
                &attrs([("backend", id.clone())]),
            );
        }
        if !self.metadata.health_check().await {
            error!("metadata store failed its health check");
        }
        results.into_iter().collect()
    }
}

pub(super) async fn run_loop(manager: DistributedStorageManager) {
    let period = Duration::from_secs(manager.config.health_check_interval_seconds);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_secs = period.as_secs(), "health loop started");

    loop {
        tokio::select! {
            _ = manager.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let results = manager.check_backend_health().await;
                debug!(?results, "health check round finished");
            }
        }
    }
    debug!("health loop stopped");
}
