//! src/services/storage_manager.rs
//!
//! DistributedStorageManager coordinates one primary and N replica
//! backends with the metadata catalog. Handles compression, content
//! hashing, deduplication, replication fan-out, access statistics and
//! metrics, and owns the lifecycle and health background loops.
//!
//! Mutating operations (`put`, `delete`, `repair_replication`, lifecycle
//! batches) are serialized by an async write lock so the content index and
//! the catalog never interleave across `.await` points. Reads take no lock;
//! a read that misses because its payload moved is retried under it.

use crate::backends::{
    BackendMetadata, REPLICA_SEGMENT, StorageBackend, build_backend, validate_key,
};
use crate::config::{ReplicationStrategy, StorageConfig};
use crate::errors::{Operation, StorageError, StorageResult};
use crate::models::metrics::StorageMetrics;
use crate::models::object::{
    DataClassification, LifecycleStage, ObjectOptions, ReplicationStatus, StorageObject,
};
use crate::services::codec::{self, EncodedPayload};
use crate::services::collaborators::{
    AllowAll, NoopTelemetry, PermissionChecker, TelemetrySink, attrs,
};
use crate::services::content_index::ContentIndex;
use crate::services::metadata_store::MetadataStore;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const PRIMARY_ID: &str = "primary";

pub fn replica_id(index: usize) -> String {
    format!("replica_{}", index)
}

/// `now + days`, or `None` if that falls outside the representable range.
pub(crate) fn days_after(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(days).and_then(|d| now.checked_add_signed(d))
}

#[derive(Clone)]
pub struct DistributedStorageManager {
    pub(super) config: Arc<StorageConfig>,
    pub(super) primary: Arc<dyn StorageBackend>,
    pub(super) replicas: Arc<Vec<Arc<dyn StorageBackend>>>,
    pub(super) metadata: MetadataStore,
    pub(super) index: Arc<ContentIndex>,
    pub(super) metrics: Arc<Mutex<StorageMetrics>>,
    pub(super) write_lock: Arc<AsyncMutex<()>>,
    pub(super) permissions: Arc<dyn PermissionChecker>,
    pub(super) telemetry: Arc<dyn TelemetrySink>,
    pub(super) cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    initialized: Arc<AtomicBool>,
}

impl DistributedStorageManager {
    /// Build backends and connect the catalog from configuration.
    ///
    /// The primary is rooted at `base_path`; local replica `i` at
    /// `base_path/.replicas/replica_<i>`.
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        let primary = build_backend(
            config.primary_backend,
            PRIMARY_ID,
            config.base_path.clone(),
            config.chunk_size_bytes,
        )?;
        let replicas = config
            .replica_backends
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let id = replica_id(i);
                let root = config.base_path.join(REPLICA_SEGMENT).join(&id);
                build_backend(*kind, id, root, config.chunk_size_bytes)
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let metadata =
            MetadataStore::connect(&config.metadata_url(), config.metadata_max_connections).await?;
        Ok(Self::with_backends(config, primary, replicas, metadata))
    }

    /// Assemble a manager from ready-made parts.
    pub fn with_backends(
        config: StorageConfig,
        primary: Arc<dyn StorageBackend>,
        replicas: Vec<Arc<dyn StorageBackend>>,
        metadata: MetadataStore,
    ) -> Self {
        Self {
            config: Arc::new(config),
            primary,
            replicas: Arc::new(replicas),
            metadata,
            index: Arc::new(ContentIndex::new()),
            metrics: Arc::new(Mutex::new(StorageMetrics::default())),
            write_lock: Arc::new(AsyncMutex::new(())),
            permissions: Arc::new(AllowAll),
            telemetry: Arc::new(NoopTelemetry),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_permission_checker(mut self, checker: Arc<dyn PermissionChecker>) -> Self {
        self.permissions = checker;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn metadata_store(&self) -> &MetadataStore {
        &self.metadata
    }

    /// Apply the schema, rebuild the content index and metrics from the
    /// catalog, and start the background loops. Calling it again is a no-op.
    pub async fn initialize(&self) -> StorageResult<()> {
        self.ensure_running()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            debug!("storage manager already initialized");
            return Ok(());
        }

        if let Err(err) = self.bootstrap().await {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let mut tasks = self.tasks.lock();
        if self.config.enable_lifecycle_management && self.config.lifecycle_interval_seconds > 0 {
            tasks.push(tokio::spawn(super::lifecycle::run_loop(self.clone())));
        }
        if self.config.health_check_interval_seconds > 0 {
            tasks.push(tokio::spawn(super::health::run_loop(self.clone())));
        }
        info!(
            backends = self.replicas.len() + 1,
            background_tasks = tasks.len(),
            "storage manager initialized"
        );
        Ok(())
    }

    async fn bootstrap(&self) -> StorageResult<()> {
        self.metadata.migrate().await?;

        if self.config.encryption_enabled {
            warn!("encryption_enabled is set but payload encryption is not implemented");
        }
        if self.config.backup_enabled {
            info!(
                interval_hours = self.config.backup_interval_hours,
                "backup scheduling is configured but not run by this engine"
            );
        }

        let entries = self.metadata.live_content_entries().await?;
        let indexed = entries.len();
        self.index.rebuild(entries);

        let total = self.metadata.count_objects().await?;
        let summary = self.metadata.stage_summary().await?;
        let mut metrics = self.metrics.lock();
        metrics.total_objects = total.max(0) as u64;
        metrics.total_bytes = summary.iter().map(|s| s.bytes.max(0) as u64).sum();
        metrics.objects_per_stage = LifecycleStage::ALL.iter().map(|s| (*s, 0)).collect();
        for stage in &summary {
            metrics
                .objects_per_stage
                .insert(stage.stage, stage.objects.max(0) as u64);
        }
        debug!(objects = total, indexed, "catalog loaded");
        Ok(())
    }

    /// Stop the background loops and wait for them to finish. Later calls
    /// on this manager (or its clones) fail with [`StorageError::Shutdown`].
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("shutting down storage manager");
        self.cancel.cancel();

        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "background task ended abnormally");
            }
        }
        // Let any in-flight write finish before the pool goes away.
        let _guard = self.write_lock.lock().await;
        self.metadata.close().await;
        info!("storage manager stopped");
    }

    pub(super) fn ensure_running(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            Err(StorageError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn authorize(
        &self,
        key: &str,
        classification: DataClassification,
        operation: Operation,
    ) -> StorageResult<()> {
        if self.permissions.check(key, classification, operation) {
            Ok(())
        } else {
            Err(StorageError::PermissionDenied {
                key: key.to_string(),
                operation,
            })
        }
    }

    fn record_outcome<T>(&self, op: &'static str, key: &str, result: &StorageResult<T>) {
        if let Err(err) = result {
            if err.is_not_found() {
                debug!(op, key, "object not found");
            } else {
                self.metrics.lock().record_failure();
                error!(op, key, error = %err, "storage operation failed");
            }
        }
    }

    // ---------------------------------------------------------------------
    // Backend plumbing
    // ---------------------------------------------------------------------

    pub(super) fn backends(&self) -> impl Iterator<Item = &Arc<dyn StorageBackend>> {
        std::iter::once(&self.primary).chain(self.replicas.iter())
    }

    /// Run one backend call under the configured deadline. An expired
    /// deadline yields `fallback`, the same as a failed call.
    pub(super) async fn bounded<T>(
        &self,
        backend: &str,
        op: &'static str,
        call: impl Future<Output = T>,
        fallback: T,
    ) -> T {
        match tokio::time::timeout(self.config.backend_timeout(), call).await {
            Ok(value) => value,
            Err(_) => {
                warn!(backend, op, "backend call timed out");
                fallback
            }
        }
    }

    fn replication_status(&self, copies: usize) -> ReplicationStatus {
        if copies >= self.config.replication_factor {
            ReplicationStatus::Complete
        } else {
            ReplicationStatus::Partial
        }
    }

    /// Read the payload at `location`, primary first, then replicas in
    /// configuration order. Only backends named in `holders` are tried;
    /// an empty list means all of them. Bytes that do not hash to
    /// `content_hash` count as a failed read.
    async fn read_payload(
        &self,
        location: &str,
        holders: &[String],
        content_hash: &str,
    ) -> Option<Bytes> {
        for backend in self.backends() {
            if !holders.is_empty() && !holders.iter().any(|id| id == backend.id()) {
                continue;
            }
            match self
                .bounded(backend.id(), "get", backend.get(location), None)
                .await
            {
                Some(bytes) if codec::verify(&bytes, content_hash) => return Some(bytes),
                Some(_) => warn!(backend = backend.id(), key = location, "payload hash mismatch, trying next backend"),
                None => warn!(backend = backend.id(), key = location, "read failed, trying next backend"),
            }
        }
        None
    }

    /// Write to each target, sequentially or concurrently. Returns the ids
    /// that stored the payload, in target order.
    async fn write_replicas(
        &self,
        key: &str,
        data: &Bytes,
        meta: &BackendMetadata,
        targets: &[&Arc<dyn StorageBackend>],
        concurrent: bool,
    ) -> Vec<String> {
        let outcomes = if concurrent {
            join_all(targets.iter().map(|backend| async move {
                let ok = self
                    .bounded(backend.id(), "put", backend.put(key, data.clone(), meta), false)
                    .await;
                (backend.id().to_string(), ok)
            }))
            .await
        } else {
            let mut outcomes = Vec::with_capacity(targets.len());
            for backend in targets {
                let ok = self
                    .bounded(backend.id(), "put", backend.put(key, data.clone(), meta), false)
                    .await;
                outcomes.push((backend.id().to_string(), ok));
            }
            outcomes
        };

        outcomes
            .into_iter()
            .filter_map(|(id, ok)| {
                if !ok {
                    warn!(backend = %id, key, "replica write failed");
                }
                ok.then_some(id)
            })
            .collect()
    }

    /// Best-effort removal of `location` from every backend.
    async fn delete_payload(&self, location: &str) {
        for backend in self.backends() {
            let removed = self
                .bounded(backend.id(), "delete", backend.delete(location), false)
                .await;
            debug!(backend = backend.id(), key = location, removed, "payload delete");
        }
    }

    // ---------------------------------------------------------------------
    // Put
    // ---------------------------------------------------------------------

    /// Store `data` under `key`, creating or overwriting the object.
    ///
    /// Fails only if the payload cannot be encoded, the primary write fails
    /// or the catalog update fails. Replica failures surface as
    /// `ReplicationStatus::Partial`.
    pub async fn put(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        options: ObjectOptions,
    ) -> StorageResult<StorageObject> {
        let started = Instant::now();
        let result = self.put_inner(key, data.into(), options).await;
        self.record_outcome("put", key, &result);

        if let Ok(obj) = &result {
            self.metrics.lock().record_write(started.elapsed());
            self.telemetry.record_event(
                "storage.put",
                &attrs([
                    ("key", obj.key.clone()),
                    ("size", obj.size_bytes.to_string()),
                    ("version", obj.version.to_string()),
                    ("replication_status", obj.replication_status.to_string()),
                    ("deduplicated", obj.dedup_reference.is_some().to_string()),
                ]),
            );
        }
        result
    }

    async fn put_inner(
        &self,
        key: &str,
        data: Bytes,
        options: ObjectOptions,
    ) -> StorageResult<StorageObject> {
        self.ensure_running()?;
        validate_key(key).map_err(StorageError::InvalidKey)?;
        self.authorize(key, options.classification, Operation::Write)?;

        let size = data.len() as i64;
        let level = self
            .config
            .compression_enabled
            .then_some(self.config.compression_level);
        let encoded = codec::encode(data, level)?;

        let _guard = self.write_lock.lock().await;
        let existing = self.metadata.get_object(key).await?;
        let content_changed = existing
            .as_ref()
            .is_some_and(|old| old.content_hash != encoded.content_hash);

        // Other keys may share the bytes about to be overwritten; move them
        // to the first of those keys before touching this location.
        if let Some(old) = existing.as_ref().filter(|_| content_changed) {
            if old.dedup_reference.is_none() {
                if let Some(successor) = self.metadata.find_referrers(key).await?.into_iter().next() {
                    self.rehome(old, &successor.key).await?;
                }
            }
        }

        let holder = if self.config.deduplication_enabled {
            match self.index.holder_for(&encoded.content_hash, key) {
                Some(holder) => self
                    .metadata
                    .get_object(&holder)
                    .await?
                    .filter(|row| row.dedup_reference.is_none()),
                None => None,
            }
        } else {
            None
        };

        let (replica_locations, replication_status, dedup_reference) = match &holder {
            Some(holder) => {
                debug!(key, holder = %holder.key, "payload deduplicated");
                (
                    holder.replica_locations.clone(),
                    holder.replication_status,
                    Some(holder.key.clone()),
                )
            }
            None => {
                let locations = self.write_payload(key, &encoded, &options).await?;
                let status = self.replication_status(locations.len());
                if status == ReplicationStatus::Partial {
                    warn!(key, copies = locations.len(), factor = self.config.replication_factor, "partial replication");
                }
                (locations, status, None)
            }
        };

        let now = Utc::now();
        let lifecycle_stage = existing
            .as_ref()
            .map_or(options.storage_policy, |old| old.lifecycle_stage.max(options.storage_policy));
        let obj = StorageObject {
            object_id: existing.as_ref().map_or_else(Uuid::new_v4, |old| old.object_id),
            key: key.to_string(),
            size_bytes: size,
            content_type: options.content_type,
            content_hash: encoded.content_hash.clone(),
            created_at: existing.as_ref().map_or(now, |old| old.created_at),
            last_accessed: now,
            access_count: existing.as_ref().map_or(0, |old| old.access_count),
            classification: options.classification,
            storage_policy: options.storage_policy,
            lifecycle_stage,
            next_transition_date: days_after(now, self.config.threshold_days(lifecycle_stage)),
            replica_locations,
            replication_status,
            custom_metadata: options.custom_metadata,
            tags: options.tags,
            version: existing.as_ref().map_or(1, |old| old.version + 1),
            is_compressed: encoded.compressed,
            dedup_reference,
            is_deleted: false,
        };
        self.metadata.store_object(&obj).await?;

        if let Some(old) = existing.as_ref().filter(|_| content_changed) {
            self.index.release(&old.content_hash, key);
        }
        self.index.insert(&obj.content_hash, key);

        {
            let mut metrics = self.metrics.lock();
            if let Some(old) = &existing {
                metrics.object_removed(old.lifecycle_stage, old.size_bytes.max(0) as u64);
            }
            metrics.object_added(obj.lifecycle_stage, obj.size_bytes.max(0) as u64);
            if obj.dedup_reference.is_some() {
                metrics.dedup_savings_bytes += encoded.bytes.len() as u64;
            }
        }

        if let Some(old) = &existing {
            self.discard_stale_copies(old, &obj).await;
        }
        Ok(obj)
    }

    /// Primary write (fatal on failure) followed by replica fan-out.
    async fn write_payload(
        &self,
        key: &str,
        encoded: &EncodedPayload,
        options: &ObjectOptions,
    ) -> StorageResult<Vec<String>> {
        let meta = backend_metadata(
            &options.content_type,
            &encoded.content_hash,
            encoded.compressed,
            &options.custom_metadata,
        );

        let stored = self
            .bounded(
                self.primary.id(),
                "put",
                self.primary.put(key, encoded.bytes.clone(), &meta),
                false,
            )
            .await;
        if !stored {
            return Err(StorageError::BackendUnavailable {
                key: key.to_string(),
                backend: self.primary.id().to_string(),
            });
        }

        let mut locations = vec![self.primary.id().to_string()];
        let targets: Vec<_> = self.replicas.iter().collect();
        let replicated = match self.config.replication_strategy {
            ReplicationStrategy::None => Vec::new(),
            ReplicationStrategy::Sync => {
                self.write_replicas(key, &encoded.bytes, &meta, &targets, false).await
            }
            ReplicationStrategy::Async => {
                self.write_replicas(key, &encoded.bytes, &meta, &targets, true).await
            }
        };
        locations.extend(replicated);
        Ok(locations)
    }

    /// After an overwrite, drop copies under `old.key` that the new row no
    /// longer uses. Best effort: a leftover copy is logged, never an error.
    async fn discard_stale_copies(&self, old: &StorageObject, new: &StorageObject) {
        if old.dedup_reference.is_some() {
            return;
        }
        if new.dedup_reference.is_some() {
            match self.metadata.find_referrers(&old.key).await {
                Ok(referrers) if referrers.is_empty() => self.delete_payload(&old.key).await,
                Ok(_) => {}
                Err(err) => warn!(key = %old.key, error = %err, "could not check referrers, keeping old payload"),
            }
            return;
        }
        for id in &old.replica_locations {
            if new.replica_locations.contains(id) {
                continue;
            }
            if let Some(backend) = self.backends().find(|b| b.id() == id) {
                let removed = self
                    .bounded(backend.id(), "delete", backend.delete(&old.key), false)
                    .await;
                debug!(backend = %id, key = %old.key, removed, "removed stale replica copy");
            }
        }
    }

    /// Copy the payload stored under `old.key` to `successor` on the same
    /// backends, then make `successor` the holder for every referrer.
    async fn rehome(&self, old: &StorageObject, successor: &str) -> StorageResult<()> {
        let mut locations = Vec::new();
        match self.read_payload(&old.key, &old.replica_locations, &old.content_hash).await {
            Some(bytes) => {
                let meta = backend_metadata(
                    &old.content_type,
                    &old.content_hash,
                    old.is_compressed,
                    &old.custom_metadata,
                );
                for backend in self.backends() {
                    if !old.replica_locations.iter().any(|id| id == backend.id()) {
                        continue;
                    }
                    let ok = self
                        .bounded(backend.id(), "put", backend.put(successor, bytes.clone(), &meta), false)
                        .await;
                    if ok {
                        locations.push(backend.id().to_string());
                    } else {
                        warn!(backend = backend.id(), key = successor, "re-home copy failed");
                    }
                }
            }
            None => error!(
                key = %old.key,
                successor,
                "shared payload unreadable on every backend, referrers cannot be served"
            ),
        }

        let status = self.replication_status(locations.len());
        let moved = self
            .metadata
            .repoint_referrers(&old.key, successor, &locations, status)
            .await?;
        self.index.set_holder(&old.content_hash, successor);
        info!(from = %old.key, to = successor, referrers = moved, "shared payload re-homed");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Get
    // ---------------------------------------------------------------------

    /// Fetch the payload for `key`, falling back across replicas.
    ///
    /// A missing or deleted key is [`StorageError::NotFound`]; a catalogued
    /// key that no backend can serve is [`StorageError::BackendUnavailable`].
    pub async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let started = Instant::now();
        let result = self.get_inner(key).await;
        self.record_outcome("get", key, &result);

        if let Ok(data) = &result {
            self.metrics.lock().record_read(started.elapsed());
            self.telemetry.record_event(
                "storage.get",
                &attrs([("key", key.to_string()), ("size", data.len().to_string())]),
            );
        }
        result
    }

    async fn get_inner(&self, key: &str) -> StorageResult<Bytes> {
        self.ensure_running()?;
        validate_key(key).map_err(StorageError::InvalidKey)?;

        let mut obj = self.lookup(key).await?;
        self.authorize(key, obj.classification, Operation::Read)?;

        let stored = match self.read_object(&obj).await {
            // A delete or overwrite of the holder can move the payload between
            // reading the row and reading the bytes. Resolve once more with
            // writers held off.
            Err(err @ StorageError::BackendUnavailable { .. }) => {
                let _guard = self.write_lock.lock().await;
                let fresh = self.lookup(key).await?;
                if !relocated(&obj, &fresh) {
                    return Err(err);
                }
                debug!(key, location = fresh.storage_location(), "payload moved during read, retrying");
                self.authorize(key, fresh.classification, Operation::Read)?;
                let stored = self.read_object(&fresh).await?;
                obj = fresh;
                stored
            }
            other => other?,
        };
        let data = codec::decode(stored, obj.is_compressed)?;

        self.metadata.update_access_stats(key).await?;
        Ok(data)
    }

    async fn lookup(&self, key: &str) -> StorageResult<StorageObject> {
        self.metadata
            .get_object(key)
            .await?
            .ok_or_else(|| StorageError::not_found(key))
    }

    /// Read the stored bytes for `obj`, following its dedup reference.
    async fn read_object(&self, obj: &StorageObject) -> StorageResult<Bytes> {
        let holders = match &obj.dedup_reference {
            Some(holder) => self
                .metadata
                .get_object(holder)
                .await?
                .map(|row| row.replica_locations)
                .unwrap_or_default(),
            None => obj.replica_locations.clone(),
        };
        self.read_payload(obj.storage_location(), &holders, &obj.content_hash)
            .await
            .ok_or_else(|| StorageError::BackendUnavailable {
                key: obj.key.clone(),
                backend: holders.join(","),
            })
    }

    // ---------------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------------

    /// Soft-delete `key` and remove its payload unless other keys share it.
    /// Returns `Ok(false)` when the key does not exist.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = self.delete_inner(key).await;
        self.record_outcome("delete", key, &result);

        if let Ok(true) = result {
            self.telemetry
                .record_event("storage.delete", &attrs([("key", key.to_string())]));
        }
        result
    }

    async fn delete_inner(&self, key: &str) -> StorageResult<bool> {
        self.ensure_running()?;
        validate_key(key).map_err(StorageError::InvalidKey)?;

        let _guard = self.write_lock.lock().await;
        let Some(existing) = self.metadata.get_object(key).await? else {
            return Ok(false);
        };
        self.authorize(key, existing.classification, Operation::Delete)?;

        let holds_payload = existing.dedup_reference.is_none();
        if holds_payload
            && let Some(successor) = self.metadata.find_referrers(key).await?.into_iter().next()
        {
            self.rehome(&existing, &successor.key).await?;
        }
        self.metadata.mark_deleted(existing.object_id).await?;
        self.index.release(&existing.content_hash, key);

        {
            let mut metrics = self.metrics.lock();
            metrics.delete_count += 1;
            metrics.object_removed(existing.lifecycle_stage, existing.size_bytes.max(0) as u64);
        }

        if holds_payload {
            self.delete_payload(key).await;
        }
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn list_objects(&self, prefix: &str, limit: i64) -> StorageResult<Vec<StorageObject>> {
        self.ensure_running()?;
        self.metadata.list_objects(prefix, limit, None).await
    }

    pub async fn list_objects_in_stage(
        &self,
        prefix: &str,
        limit: i64,
        stage: LifecycleStage,
    ) -> StorageResult<Vec<StorageObject>> {
        self.ensure_running()?;
        self.metadata.list_objects(prefix, limit, Some(stage)).await
    }

    /// Catalog entry for `key`, without touching access statistics.
    pub async fn get_object_info(&self, key: &str) -> StorageResult<Option<StorageObject>> {
        self.ensure_running()?;
        self.metadata.get_object(key).await
    }

    pub fn get_metrics(&self) -> StorageMetrics {
        self.metrics.lock().clone()
    }

    pub fn backend_health(&self) -> BTreeMap<String, bool> {
        self.metrics.lock().backend_health.clone()
    }

    // ---------------------------------------------------------------------
    // Replication repair
    // ---------------------------------------------------------------------

    /// Copy payloads of up to `limit` partially replicated objects to the
    /// replicas missing them. Returns how many objects reached `complete`.
    pub async fn repair_replication(&self, limit: i64) -> StorageResult<usize> {
        self.ensure_running()?;
        let _guard = self.write_lock.lock().await;
        let rows = self
            .metadata
            .list_by_replication_status(ReplicationStatus::Partial, limit)
            .await?;

        let mut repaired = 0;
        for mut row in rows {
            if let Some(holder) = &row.dedup_reference {
                // Referrers follow their holder; the holder is repaired as its own row.
                let Some(holder_row) = self.metadata.get_object(holder).await? else {
                    continue;
                };
                if holder_row.replication_status != ReplicationStatus::Complete {
                    continue;
                }
                row.replica_locations = holder_row.replica_locations;
                row.replication_status = ReplicationStatus::Complete;
                self.metadata.store_object(&row).await?;
                repaired += 1;
                continue;
            }

            let missing: Vec<_> = self
                .backends()
                .filter(|b| !row.replica_locations.iter().any(|id| id == b.id()))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let Some(bytes) = self
                .read_payload(&row.key, &row.replica_locations, &row.content_hash)
                .await
            else {
                warn!(key = %row.key, "no readable copy, skipping repair");
                continue;
            };

            let meta = backend_metadata(
                &row.content_type,
                &row.content_hash,
                row.is_compressed,
                &row.custom_metadata,
            );
            let concurrent = self.config.replication_strategy == ReplicationStrategy::Async;
            let added = self
                .write_replicas(&row.key, &bytes, &meta, &missing, concurrent)
                .await;
            if added.is_empty() {
                continue;
            }

            // Keep backend order stable: primary, then replicas by index.
            let held: Vec<String> = self
                .backends()
                .map(|b| b.id().to_string())
                .filter(|id| row.replica_locations.contains(id) || added.contains(id))
                .collect();
            row.replication_status = self.replication_status(held.len());
            row.replica_locations = held;
            self.metadata.store_object(&row).await?;

            if row.replication_status == ReplicationStatus::Complete {
                repaired += 1;
            }
            info!(key = %row.key, copies = row.replica_locations.len(), "replication repaired");
        }
        Ok(repaired)
    }
}

/// Whether `fresh` stores its payload somewhere other than `stale` did.
fn relocated(stale: &StorageObject, fresh: &StorageObject) -> bool {
    stale.object_id != fresh.object_id
        || stale.version != fresh.version
        || stale.storage_location() != fresh.storage_location()
}

fn backend_metadata(
    content_type: &str,
    content_hash: &str,
    compressed: bool,
    custom: &BTreeMap<String, String>,
) -> BackendMetadata {
    let mut meta: BackendMetadata = custom
        .iter()
        .map(|(k, v)| (format!("x-meta-{}", k), v.clone()))
        .collect();
    meta.insert("content_type".into(), content_type.to_string());
    meta.insert("content_hash".into(), content_hash.to_string());
    meta.insert("compressed".into(), compressed.to_string());
    meta
}
