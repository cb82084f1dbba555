//! Access-driven tiering: hot → warm → cold → archive.
//!
//! A sweep walks the transitions in reverse tier order so an object moves
//! at most one tier per sweep. Archive objects past retention are only
//! reported; deleting them is left to an external policy.

use super::storage_manager::{DistributedStorageManager, days_after};
use crate::errors::StorageResult;
use crate::models::object::LifecycleStage;
use crate::services::collaborators::attrs;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifecycleReport {
    /// Objects moved into each destination tier.
    pub transitions: BTreeMap<LifecycleStage, u64>,
    /// Archive objects idle longer than the retention period, counted up to
    /// `lifecycle_batch_size * lifecycle_max_batches`.
    pub retention_eligible: u64,
}

impl LifecycleReport {
    pub fn moved_to(&self, stage: LifecycleStage) -> u64 {
        self.transitions.get(&stage).copied().unwrap_or(0)
    }

    pub fn total_transitions(&self) -> u64 {
        self.transitions.values().sum()
    }
}

impl DistributedStorageManager {
    /// Run one lifecycle sweep now.
    pub async fn run_lifecycle_sweep(&self) -> StorageResult<LifecycleReport> {
        self.ensure_running()?;
        let mut report = LifecycleReport {
            retention_eligible: self.count_retention_eligible().await?,
            ..LifecycleReport::default()
        };

        for from in [LifecycleStage::Cold, LifecycleStage::Warm, LifecycleStage::Hot] {
            let Some(to) = from.next() else { continue };
            let moved = self.advance_stage(from, to).await?;
            if moved > 0 {
                report.transitions.insert(to, moved);
            }
        }

        info!(
            transitions = report.total_transitions(),
            retention_eligible = report.retention_eligible,
            "lifecycle sweep finished"
        );
        Ok(report)
    }

    async fn count_retention_eligible(&self) -> StorageResult<u64> {
        let now = Utc::now();
        let Some(cutoff) = days_after(now, -self.config.archive_retention_days) else {
            return Ok(0);
        };
        let max_batches = i64::try_from(self.config.lifecycle_max_batches).unwrap_or(i64::MAX);
        let scan_limit = self.config.lifecycle_batch_size.saturating_mul(max_batches);
        let eligible = self
            .metadata
            .get_lifecycle_candidates(LifecycleStage::Archive, cutoff, scan_limit)
            .await?
            .len() as u64;
        if eligible > 0 {
            self.telemetry.record_event(
                "storage.lifecycle.retention_eligible",
                &attrs([("count", eligible.to_string())]),
            );
        }
        Ok(eligible)
    }

    /// Move idle objects from `from` to `to` in bounded batches.
    async fn advance_stage(&self, from: LifecycleStage, to: LifecycleStage) -> StorageResult<u64> {
        let batch_size = self.config.lifecycle_batch_size;
        let mut moved = 0u64;

        for batch in 0..self.config.lifecycle_max_batches {
            if self.cancel.is_cancelled() {
                debug!(%from, "sweep interrupted by shutdown");
                break;
            }
            let now = Utc::now();
            let Some(cutoff) = days_after(now, -self.config.threshold_days(from)) else {
                break;
            };
            let next_date = days_after(now, self.config.threshold_days(to));

            // Hold the write lock per batch so a concurrent overwrite cannot
            // restore a stale stage.
            let _guard = self.write_lock.lock().await;
            let candidates = self
                .metadata
                .get_lifecycle_candidates(from, cutoff, batch_size)
                .await?;
            let fetched = candidates.len();

            let mut advanced = 0u64;
            for obj in candidates {
                if !self
                    .metadata
                    .advance_lifecycle(obj.object_id, from, to, next_date)
                    .await?
                {
                    continue;
                }
                advanced += 1;
                self.metrics.lock().stage_changed(from, to);
                self.telemetry.record_event(
                    "storage.lifecycle.transition",
                    &attrs([
                        ("key", obj.key.clone()),
                        ("from", from.to_string()),
                        ("to", to.to_string()),
                    ]),
                );
            }
            moved += advanced;
            debug!(%from, %to, batch, advanced, "lifecycle batch done");

            if (fetched as i64) < batch_size || advanced == 0 {
                break;
            }
        }
        Ok(moved)
    }
}

/// Periodic sweep until the manager is cancelled. The first sweep runs one
/// interval after start.
pub(super) async fn run_loop(manager: DistributedStorageManager) {
    let period = Duration::from_secs(manager.config.lifecycle_interval_seconds);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = period.as_secs(), "lifecycle loop started");

    loop {
        tokio::select! {
            _ = manager.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = manager.run_lifecycle_sweep().await {
                    error!(error = %err, "lifecycle sweep failed");
                }
            }
        }
    }
    debug!("lifecycle loop stopped");
}
