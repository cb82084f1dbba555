//! Process-wide counters describing engine activity.

use crate::models::object::LifecycleStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Aggregate counters for one manager instance.
///
/// Created at manager start, updated on every operation and never persisted.
/// `total_objects` and `total_bytes` are seeded from the metadata store at
/// initialization so they always match the live catalog.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StorageMetrics {
    /// Non-deleted objects in the catalog.
    pub total_objects: u64,

    /// Sum of logical (uncompressed) sizes of non-deleted objects.
    pub total_bytes: u64,

    pub read_count: u64,
    pub write_count: u64,
    pub delete_count: u64,

    /// Running average latency of successful reads, in milliseconds.
    pub avg_read_latency_ms: f64,

    /// Running average latency of successful writes, in milliseconds.
    pub avg_write_latency_ms: f64,

    /// Non-deleted objects per lifecycle tier.
    pub objects_per_stage: BTreeMap<LifecycleStage, u64>,

    /// Bytes not written to the backends thanks to deduplication.
    pub dedup_savings_bytes: u64,

    /// Put/Get/Delete calls that failed for a reason other than a miss.
    pub failed_operations: u64,

    /// Latest health check result per backend identifier.
    pub backend_health: BTreeMap<String, bool>,

    pub last_health_check: Option<DateTime<Utc>>,
}

impl StorageMetrics {
    pub fn record_read(&mut self, elapsed: Duration) {
        self.read_count += 1;
        self.avg_read_latency_ms =
            running_average(self.avg_read_latency_ms, self.read_count, elapsed);
    }

    pub fn record_write(&mut self, elapsed: Duration) {
        self.write_count += 1;
        self.avg_write_latency_ms =
            running_average(self.avg_write_latency_ms, self.write_count, elapsed);
    }

    pub fn record_failure(&mut self) {
        self.failed_operations += 1;
    }

    /// Account for a newly created object.
    pub fn object_added(&mut self, stage: LifecycleStage, size: u64) {
        self.total_objects += 1;
        self.total_bytes += size;
        *self.objects_per_stage.entry(stage).or_default() += 1;
    }

    /// Account for an object leaving the live catalog.
    pub fn object_removed(&mut self, stage: LifecycleStage, size: u64) {
        self.total_objects = self.total_objects.saturating_sub(1);
        self.total_bytes = self.total_bytes.saturating_sub(size);
        if let Some(count) = self.objects_per_stage.get_mut(&stage) {
            *count = count.saturating_sub(1);
        }
    }

    /// Move one object between tiers.
    pub fn stage_changed(&mut self, from: LifecycleStage, to: LifecycleStage) {
        if from == to {
            return;
        }
        if let Some(count) = self.objects_per_stage.get_mut(&from) {
            *count = count.saturating_sub(1);
        }
        *self.objects_per_stage.entry(to).or_default() += 1;
    }
}

fn running_average(current: f64, count: u64, sample: Duration) -> f64 {
    let sample_ms = sample.as_secs_f64() * 1000.0;
    if count <= 1 {
        return sample_ms;
    }
    current + (sample_ms - current) / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_average_tracks_mean() {
        let mut m = StorageMetrics::default();
        m.record_read(Duration::from_millis(10));
        m.record_read(Duration::from_millis(20));
        m.record_read(Duration::from_millis(30));
        assert_eq!(m.read_count, 3);
        assert!((m.avg_read_latency_ms - 20.0).abs() < 1e-6);
    }

    #[test]
    fn object_accounting_never_underflows() {
        let mut m = StorageMetrics::default();
        m.object_added(LifecycleStage::Hot, 100);
        m.object_removed(LifecycleStage::Hot, 100);
        m.object_removed(LifecycleStage::Hot, 100);
        assert_eq!(m.total_objects, 0);
        assert_eq!(m.total_bytes, 0);
        assert_eq!(m.objects_per_stage.get(&LifecycleStage::Hot), Some(&0));
    }

    #[test]
    fn stage_change_moves_one_count() {
        let mut m = StorageMetrics::default();
        m.object_added(LifecycleStage::Hot, 1);
        m.stage_changed(LifecycleStage::Hot, LifecycleStage::Warm);
        assert_eq!(m.objects_per_stage[&LifecycleStage::Hot], 0);
        assert_eq!(m.objects_per_stage[&LifecycleStage::Warm], 1);
    }
}
