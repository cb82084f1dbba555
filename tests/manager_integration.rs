use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use dist_storage::{
    DataClassification, DistributedStorageManager, LifecycleStage, MemoryBackend, MetadataStore,
    ObjectOptions, ReplicationStatus, ReplicationStrategy, StorageBackend, StorageConfig,
    StorageError, TelemetrySink,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    manager: DistributedStorageManager,
    primary: Arc<MemoryBackend>,
    replicas: Vec<Arc<MemoryBackend>>,
}

fn quiet(config: StorageConfig) -> StorageConfig {
    StorageConfig {
        health_check_interval_seconds: 0,
        enable_lifecycle_management: false,
        ..config
    }
}

async fn harness(config: StorageConfig, replica_count: usize) -> Harness {
    let primary = Arc::new(MemoryBackend::new("primary"));
    let replicas: Vec<_> = (0..replica_count)
        .map(|i| Arc::new(MemoryBackend::new(format!("replica_{}", i))))
        .collect();
    let metadata = MetadataStore::in_memory().await.unwrap();
    let manager = DistributedStorageManager::with_backends(
        quiet(config),
        primary.clone(),
        replicas
            .iter()
            .map(|r| r.clone() as Arc<dyn StorageBackend>)
            .collect(),
        metadata,
    );
    manager.initialize().await.unwrap();
    Harness {
        manager,
        primary,
        replicas,
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<String>>,
    metrics: Mutex<Vec<(String, f64, String)>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn record_event(&self, name: &str, _attributes: &BTreeMap<String, String>) {
        self.events.lock().push(name.to_string());
    }

    fn record_metric(&self, name: &str, value: f64, attributes: &BTreeMap<String, String>) {
        let backend = attributes.get("backend").cloned().unwrap_or_default();
        self.metrics.lock().push((name.to_string(), value, backend));
    }
}

#[tokio::test]
async fn document_round_trip_with_info() {
    let h = harness(StorageConfig::default(), 0).await;
    let options = ObjectOptions::default()
        .content_type("text/plain")
        .classification(DataClassification::Internal)
        .storage_policy(LifecycleStage::Hot)
        .tag("document");
    h.manager
        .put("documents/report.txt", "test document", options)
        .await
        .unwrap();

    let data = h.manager.get("documents/report.txt").await.unwrap();
    assert_eq!(data, Bytes::from_static(b"test document"));

    let info = h
        .manager
        .get_object_info("documents/report.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.content_type, "text/plain");
    assert_eq!(info.tags, ["document".to_string()].into());
    assert_eq!(info.access_count, 1);
    assert_eq!(info.version, 1);
    assert_eq!(info.replica_locations, vec!["primary"]);
    assert_eq!(info.replication_status, ReplicationStatus::Complete);
    assert!(info.next_transition_date.is_some());
}

#[tokio::test]
async fn empty_and_binary_payloads_round_trip() {
    let h = harness(StorageConfig::default(), 0).await;
    let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    h.manager.put("bin", binary.clone(), ObjectOptions::default()).await.unwrap();
    h.manager.put("empty", Bytes::new(), ObjectOptions::default()).await.unwrap();

    assert_eq!(h.manager.get("bin").await.unwrap(), Bytes::from(binary));
    assert!(h.manager.get("empty").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_hides_object_everywhere() {
    let h = harness(StorageConfig::default(), 0).await;
    h.manager.put("a", "1", ObjectOptions::default()).await.unwrap();
    h.manager.put("b", "2", ObjectOptions::default()).await.unwrap();

    assert!(h.manager.delete("a").await.unwrap());
    assert!(!h.manager.delete("a").await.unwrap());
    assert!(h.manager.get("a").await.unwrap_err().is_not_found());

    let keys: Vec<_> = h
        .manager
        .list_objects("", 100)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.key)
        .collect();
    assert_eq!(keys, vec!["b"]);
    assert!(!h.primary.exists("a").await);

    let metrics = h.manager.get_metrics();
    assert_eq!(metrics.delete_count, 1);
    assert_eq!(metrics.failed_operations, 0);
}

#[tokio::test]
async fn delete_then_put_creates_new_identity() {
    let h = harness(StorageConfig::default(), 0).await;
    let first = h.manager.put("k", "v", ObjectOptions::default()).await.unwrap();
    h.manager.delete("k").await.unwrap();
    let second = h.manager.put("k", "v", ObjectOptions::default()).await.unwrap();

    assert_ne!(first.object_id, second.object_id);
    assert_eq!(second.version, 1);
    let audit = h
        .manager
        .metadata_store()
        .get_object_by_id(first.object_id)
        .await
        .unwrap()
        .unwrap();
    assert!(audit.is_deleted);
}

#[tokio::test]
async fn literal_prefix_listing() {
    let h = harness(StorageConfig::default(), 0).await;
    for key in ["100%/a", "100x/b", "logs/2024/a", "logs/2025/b", "Logs/c"] {
        h.manager.put(key, key, ObjectOptions::default()).await.unwrap();
    }
    let keys = |objs: Vec<dist_storage::StorageObject>| {
        objs.into_iter().map(|o| o.key).collect::<Vec<_>>()
    };

    assert_eq!(keys(h.manager.list_objects("100%", 10).await.unwrap()), vec!["100%/a"]);
    assert_eq!(
        keys(h.manager.list_objects("logs/", 10).await.unwrap()),
        vec!["logs/2024/a", "logs/2025/b"]
    );
    assert_eq!(h.manager.list_objects("", 3).await.unwrap().len(), 3);
}

#[tokio::test]
async fn injection_payload_keys_are_ordinary() {
    let h = harness(StorageConfig::default(), 0).await;
    let nasty = "'; DROP TABLE storage_objects; --";
    h.manager.put("safe", "other", ObjectOptions::default()).await.unwrap();
    h.manager.put(nasty, "payload", ObjectOptions::default()).await.unwrap();

    assert_eq!(h.manager.get(nasty).await.unwrap(), Bytes::from_static(b"payload"));
    assert_eq!(h.manager.list_objects(nasty, 10).await.unwrap().len(), 1);
    assert_eq!(h.manager.get("safe").await.unwrap(), Bytes::from_static(b"other"));
    assert!(h.manager.delete(nasty).await.unwrap());
    assert_eq!(h.manager.metadata_store().count_objects().await.unwrap(), 1);
}

#[tokio::test]
async fn sync_replication_reaches_factor() {
    let config = StorageConfig {
        replication_strategy: ReplicationStrategy::Sync,
        replication_factor: 3,
        ..StorageConfig::default()
    };
    let h = harness(config, 2).await;
    let obj = h.manager.put("k", "v", ObjectOptions::default()).await.unwrap();

    assert_eq!(obj.replica_locations, vec!["primary", "replica_0", "replica_1"]);
    assert_eq!(obj.replication_status, ReplicationStatus::Complete);
    for replica in &h.replicas {
        assert!(replica.exists("k").await);
    }
}

#[tokio::test]
async fn async_replication_tolerates_a_down_replica() {
    let config = StorageConfig {
        replication_strategy: ReplicationStrategy::Async,
        replication_factor: 3,
        ..StorageConfig::default()
    };
    let h = harness(config, 2).await;
    h.replicas[1].set_available(false);

    let obj = h.manager.put("k", "v", ObjectOptions::default()).await.unwrap();
    assert_eq!(obj.replica_locations, vec!["primary", "replica_0"]);
    assert_eq!(obj.replication_status, ReplicationStatus::Partial);
    assert_eq!(h.manager.get_metrics().failed_operations, 0);

    // Bring the replica back and reconcile.
    h.replicas[1].set_available(true);
    assert_eq!(h.manager.repair_replication(10).await.unwrap(), 1);
    let repaired = h.manager.get_object_info("k").await.unwrap().unwrap();
    assert_eq!(repaired.replication_status, ReplicationStatus::Complete);
    assert_eq!(repaired.replica_locations, vec!["primary", "replica_0", "replica_1"]);
    assert!(h.replicas[1].exists("k").await);
}

#[tokio::test]
async fn no_strategy_writes_primary_only() {
    let config = StorageConfig {
        replication_factor: 2,
        ..StorageConfig::default()
    };
    let h = harness(config, 1).await;
    let obj = h.manager.put("k", "v", ObjectOptions::default()).await.unwrap();
    assert_eq!(obj.replica_locations, vec!["primary"]);
    assert_eq!(obj.replication_status, ReplicationStatus::Partial);
    assert!(h.replicas[0].is_empty());
}

#[tokio::test]
async fn reads_fail_over_to_replicas() {
    let config = StorageConfig {
        replication_strategy: ReplicationStrategy::Sync,
        replication_factor: 2,
        ..StorageConfig::default()
    };
    let h = harness(config, 1).await;
    h.manager.put("k", "replicated", ObjectOptions::default()).await.unwrap();

    h.primary.set_available(false);
    assert_eq!(h.manager.get("k").await.unwrap(), Bytes::from_static(b"replicated"));

    h.replicas[0].set_available(false);
    let err = h.manager.get("k").await.unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable { .. }));
    assert_eq!(h.manager.get_metrics().failed_operations, 1);
}

#[tokio::test]
async fn corrupted_copy_falls_back_to_intact_replica() {
    let config = StorageConfig {
        replication_strategy: ReplicationStrategy::Sync,
        replication_factor: 2,
        ..StorageConfig::default()
    };
    let h = harness(config, 1).await;
    h.manager.put("k", "replicated", ObjectOptions::default()).await.unwrap();
    assert!(h.primary.put("k", Bytes::from_static(b"bit rot"), &BTreeMap::new()).await);

    assert_eq!(h.manager.get("k").await.unwrap(), Bytes::from_static(b"replicated"));

    assert!(h.replicas[0].put("k", Bytes::from_static(b"bit rot"), &BTreeMap::new()).await);
    let err = h.manager.get("k").await.unwrap_err();
    assert!(matches!(err, StorageError::BackendUnavailable { .. }));
}

#[tokio::test]
async fn identical_content_is_stored_once() {
    let h = harness(StorageConfig::default(), 0).await;
    let a = h.manager.put("file1.txt", "same bytes", ObjectOptions::default()).await.unwrap();
    let b = h.manager.put("file2.txt", "same bytes", ObjectOptions::default()).await.unwrap();

    assert_eq!(a.content_hash, b.content_hash);
    assert_eq!(b.dedup_reference.as_deref(), Some("file1.txt"));
    assert!(!h.primary.exists("file2.txt").await);
    assert_eq!(h.manager.get("file1.txt").await.unwrap(), h.manager.get("file2.txt").await.unwrap());
    assert_eq!(h.manager.get_metrics().dedup_savings_bytes, "same bytes".len() as u64);
}

#[tokio::test]
async fn deleting_the_holder_rehomes_shared_bytes() {
    let h = harness(StorageConfig::default(), 0).await;
    for key in ["file1.txt", "file2.txt", "file3.txt"] {
        h.manager.put(key, "shared", ObjectOptions::default()).await.unwrap();
    }
    assert!(h.manager.delete("file1.txt").await.unwrap());

    assert!(!h.primary.exists("file1.txt").await);
    assert!(h.primary.exists("file2.txt").await);
    let two = h.manager.get_object_info("file2.txt").await.unwrap().unwrap();
    let three = h.manager.get_object_info("file3.txt").await.unwrap().unwrap();
    assert_eq!(two.dedup_reference, None);
    assert_eq!(three.dedup_reference.as_deref(), Some("file2.txt"));
    assert_eq!(h.manager.get("file3.txt").await.unwrap(), Bytes::from_static(b"shared"));

    h.manager.delete("file2.txt").await.unwrap();
    h.manager.delete("file3.txt").await.unwrap();
    assert!(h.primary.is_empty());
}

#[tokio::test]
async fn overwriting_the_holder_keeps_referrers_readable() {
    let h = harness(StorageConfig::default(), 0).await;
    h.manager.put("a", "original", ObjectOptions::default()).await.unwrap();
    h.manager.put("b", "original", ObjectOptions::default()).await.unwrap();
    h.manager.put("a", "changed", ObjectOptions::default()).await.unwrap();

    assert_eq!(h.manager.get("a").await.unwrap(), Bytes::from_static(b"changed"));
    assert_eq!(h.manager.get("b").await.unwrap(), Bytes::from_static(b"original"));
    let b = h.manager.get_object_info("b").await.unwrap().unwrap();
    assert_eq!(b.dedup_reference, None);
}

#[tokio::test]
async fn dedup_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = quiet(StorageConfig::with_base_path(dir.path()));

    let first = DistributedStorageManager::new(config.clone()).await.unwrap();
    first.initialize().await.unwrap();
    first.put("x", "payload", ObjectOptions::default()).await.unwrap();
    first.shutdown().await;

    let second = DistributedStorageManager::new(config).await.unwrap();
    second.initialize().await.unwrap();
    assert_eq!(second.get_metrics().total_objects, 1);
    let y = second.put("y", "payload", ObjectOptions::default()).await.unwrap();
    assert_eq!(y.dedup_reference.as_deref(), Some("x"));
    assert_eq!(second.get("y").await.unwrap(), Bytes::from_static(b"payload"));
    second.shutdown().await;
}

#[tokio::test]
async fn dedup_can_be_disabled() {
    let config = StorageConfig {
        deduplication_enabled: false,
        ..StorageConfig::default()
    };
    let h = harness(config, 0).await;
    h.manager.put("a", "same", ObjectOptions::default()).await.unwrap();
    let b = h.manager.put("b", "same", ObjectOptions::default()).await.unwrap();
    assert_eq!(b.dedup_reference, None);
    assert!(h.primary.exists("b").await);
}

async fn backdate(manager: &DistributedStorageManager, key: &str, days: i64) {
    let store = manager.metadata_store();
    let mut obj = store.get_object(key).await.unwrap().unwrap();
    obj.last_accessed = Utc::now() - ChronoDuration::days(days);
    store.store_object(&obj).await.unwrap();
}

#[tokio::test]
async fn idle_objects_move_one_tier_per_sweep() {
    let h = harness(StorageConfig::default(), 0).await;
    h.manager.put("stale", "s", ObjectOptions::default()).await.unwrap();
    h.manager.put("fresh", "f", ObjectOptions::default()).await.unwrap();
    backdate(&h.manager, "stale", 400).await;

    let report = h.manager.run_lifecycle_sweep().await.unwrap();
    assert_eq!(report.moved_to(LifecycleStage::Warm), 1);
    assert_eq!(report.total_transitions(), 1);

    let stale = h.manager.get_object_info("stale").await.unwrap().unwrap();
    assert_eq!(stale.lifecycle_stage, LifecycleStage::Warm);
    let next = stale.next_transition_date.unwrap();
    assert!(next > Utc::now() + ChronoDuration::days(89));
    let fresh = h.manager.get_object_info("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.lifecycle_stage, LifecycleStage::Hot);

    let second = h.manager.run_lifecycle_sweep().await.unwrap();
    assert_eq!(second.moved_to(LifecycleStage::Cold), 1);

    let metrics = h.manager.get_metrics();
    assert_eq!(metrics.objects_per_stage[&LifecycleStage::Cold], 1);
    assert_eq!(metrics.objects_per_stage[&LifecycleStage::Hot], 1);
    assert_eq!(
        h.manager
            .list_objects_in_stage("", 10, LifecycleStage::Cold)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn sweep_respects_batch_limits() {
    let config = StorageConfig {
        lifecycle_batch_size: 2,
        lifecycle_max_batches: 2,
        ..StorageConfig::default()
    };
    let h = harness(config, 0).await;
    for i in 0..5 {
        let key = format!("k{}", i);
        h.manager.put(&key, key.clone(), ObjectOptions::default()).await.unwrap();
        backdate(&h.manager, &key, 40).await;
    }
    let report = h.manager.run_lifecycle_sweep().await.unwrap();
    assert_eq!(report.moved_to(LifecycleStage::Warm), 4);
}

#[tokio::test]
async fn archive_past_retention_is_reported_not_deleted() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let h = harness(StorageConfig::default(), 0).await;
    let manager = h.manager.clone().with_telemetry(telemetry.clone());
    let archive = ObjectOptions::default().storage_policy(LifecycleStage::Archive);
    manager.put("old", "o", archive).await.unwrap();
    backdate(&manager, "old", 3000).await;

    let report = manager.run_lifecycle_sweep().await.unwrap();
    assert_eq!(report.retention_eligible, 1);
    assert_eq!(report.total_transitions(), 0);
    assert!(manager.get("old").await.is_ok());
    assert!(
        telemetry
            .events
            .lock()
            .iter()
            .any(|e| e == "storage.lifecycle.retention_eligible")
    );
}

#[tokio::test]
async fn sweep_tolerates_unbounded_batch_settings() {
    let config = StorageConfig {
        lifecycle_batch_size: i64::MAX,
        lifecycle_max_batches: usize::MAX,
        ..StorageConfig::default()
    };
    let h = harness(config, 0).await;
    let archive = ObjectOptions::default().storage_policy(LifecycleStage::Archive);
    h.manager.put("old", "o", archive).await.unwrap();
    h.manager.put("idle", "i", ObjectOptions::default()).await.unwrap();
    backdate(&h.manager, "old", 3000).await;
    backdate(&h.manager, "idle", 45).await;

    let report = h.manager.run_lifecycle_sweep().await.unwrap();
    assert_eq!(report.retention_eligible, 1);
    assert_eq!(report.moved_to(LifecycleStage::Warm), 1);
    assert_eq!(report.total_transitions(), 1);
}

#[tokio::test]
async fn metrics_track_catalog() {
    let h = harness(StorageConfig::default(), 0).await;
    h.manager.put("a", "12345", ObjectOptions::default()).await.unwrap();
    h.manager.put("b", "123", ObjectOptions::default()).await.unwrap();
    h.manager.put("a", "1", ObjectOptions::default()).await.unwrap();
    h.manager.delete("b").await.unwrap();
    assert!(h.manager.get("missing").await.unwrap_err().is_not_found());

    let metrics = h.manager.get_metrics();
    let rows = h.manager.metadata_store().count_objects().await.unwrap();
    assert_eq!(metrics.total_objects, rows as u64);
    assert_eq!(metrics.total_bytes, 1);
    assert_eq!(metrics.write_count, 3);
    assert_eq!(metrics.failed_operations, 0);

    h.primary.set_available(false);
    assert!(h.manager.put("c", "x", ObjectOptions::default()).await.is_err());
    assert!(h.manager.get("a").await.is_err());
    assert_eq!(h.manager.get_metrics().failed_operations, 2);
}

#[tokio::test]
async fn health_checks_feed_metrics_and_telemetry() {
    let telemetry = Arc::new(RecordingTelemetry::default());
    let h = harness(StorageConfig::default(), 1).await;
    let manager = h.manager.clone().with_telemetry(telemetry.clone());
    h.replicas[0].set_available(false);

    let results = manager.check_backend_health().await;
    assert_eq!(results.get("primary"), Some(&true));
    assert_eq!(results.get("replica_0"), Some(&false));
    assert_eq!(manager.backend_health(), results);
    assert!(manager.get_metrics().last_health_check.is_some());

    let recorded = telemetry.metrics.lock();
    assert!(recorded.contains(&("storage.backend.health".to_string(), 0.0, "replica_0".to_string())));
    assert!(recorded.contains(&("storage.backend.health".to_string(), 1.0, "primary".to_string())));
}

#[tokio::test]
async fn background_loops_stop_on_shutdown() {
    let config = StorageConfig {
        health_check_interval_seconds: 1,
        enable_lifecycle_management: true,
        lifecycle_interval_seconds: 1,
        ..StorageConfig::default()
    };
    let metadata = MetadataStore::in_memory().await.unwrap();
    let manager = DistributedStorageManager::with_backends(
        config,
        Arc::new(MemoryBackend::new("primary")),
        Vec::new(),
        metadata,
    );
    manager.initialize().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(manager.backend_health().get("primary"), Some(&true));

    tokio::time::timeout(std::time::Duration::from_secs(5), manager.shutdown())
        .await
        .expect("shutdown should not hang");
    assert!(matches!(
        manager.put("k", "v", ObjectOptions::default()).await,
        Err(StorageError::Shutdown)
    ));
}

#[tokio::test]
async fn filesystem_backends_from_config() {
    let dir = TempDir::new().unwrap();
    let config = quiet(StorageConfig {
        replication_strategy: ReplicationStrategy::Sync,
        replication_factor: 2,
        replica_backends: vec![dist_storage::BackendKind::Local],
        ..StorageConfig::with_base_path(dir.path())
    });
    let manager = DistributedStorageManager::new(config).await.unwrap();
    manager.initialize().await.unwrap();

    let obj = manager
        .put("docs/nested/file.txt", "on disk", ObjectOptions::default())
        .await
        .unwrap();
    assert_eq!(obj.replication_status, ReplicationStatus::Complete);
    assert!(dir.path().join("docs/nested/file.txt").is_file());
    assert!(dir.path().join(".replicas/replica_0/docs/nested/file.txt").is_file());
    assert_eq!(
        manager.get("docs/nested/file.txt").await.unwrap(),
        Bytes::from_static(b"on disk")
    );
    manager.shutdown().await;
}
