//! src/services/metadata_store.rs
//!
//! MetadataStore: indexed SQLite catalog of `StorageObject` rows, kept
//! independent of payload storage. Every key, prefix and timestamp reaches
//! SQLite as a bound parameter; no caller-provided text is ever spliced
//! into a statement.

use crate::errors::StorageResult;
use crate::models::object::{LifecycleStage, ReplicationStatus, StorageObject, StorageObjectRow};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const OBJECT_COLUMNS: &str = "object_id, key, size_bytes, content_type, content_hash, \
     created_at, last_accessed, access_count, classification, storage_policy, \
     lifecycle_stage, next_transition_date, replica_locations, replication_status, \
     custom_metadata, tags, version, is_compressed, dedup_reference, is_deleted";

/// One live row's contribution to the content-hash index.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContentEntry {
    pub key: String,
    pub content_hash: String,
    pub dedup_reference: Option<String>,
}

/// Live object count and logical bytes for one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    pub stage: LifecycleStage,
    pub objects: i64,
    pub bytes: i64,
}

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (creating if needed) the SQLite database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> StorageResult<Self> {
        let db_path = url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:")
            .trim_start_matches("file:");
        if !db_path.starts_with(":memory:") {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;
        debug!("Connected metadata store at {}", url);
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> StorageResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StorageResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Insert or replace a row, keyed by `object_id`.
    ///
    /// A second live row for an existing key violates the partial unique
    /// index and is reported as a metadata error.
    pub async fn store_object(&self, obj: &StorageObject) -> StorageResult<()> {
        let replicas = serde_json::to_string(&obj.replica_locations)?;
        let custom = serde_json::to_string(&obj.custom_metadata)?;
        let tags = serde_json::to_string(&obj.tags)?;

        sqlx::query(
            r#"
            INSERT INTO storage_objects (
                object_id, key, size_bytes, content_type, content_hash,
                created_at, last_accessed, access_count, classification, storage_policy,
                lifecycle_stage, next_transition_date, replica_locations, replication_status,
                custom_metadata, tags, version, is_compressed, dedup_reference, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(object_id) DO UPDATE SET
                key = excluded.key,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type,
                content_hash = excluded.content_hash,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count,
                classification = excluded.classification,
                storage_policy = excluded.storage_policy,
                lifecycle_stage = excluded.lifecycle_stage,
                next_transition_date = excluded.next_transition_date,
                replica_locations = excluded.replica_locations,
                replication_status = excluded.replication_status,
                custom_metadata = excluded.custom_metadata,
                tags = excluded.tags,
                version = excluded.version,
                is_compressed = excluded.is_compressed,
                dedup_reference = excluded.dedup_reference,
                is_deleted = excluded.is_deleted
            "#,
        )
        .bind(obj.object_id)
        .bind(&obj.key)
        .bind(obj.size_bytes)
        .bind(&obj.content_type)
        .bind(&obj.content_hash)
        .bind(obj.created_at)
        .bind(obj.last_accessed)
        .bind(obj.access_count)
        .bind(obj.classification.as_str())
        .bind(obj.storage_policy.as_str())
        .bind(obj.lifecycle_stage.as_str())
        .bind(obj.next_transition_date)
        .bind(replicas)
        .bind(obj.replication_status.as_str())
        .bind(custom)
        .bind(tags)
        .bind(obj.version)
        .bind(obj.is_compressed)
        .bind(&obj.dedup_reference)
        .bind(obj.is_deleted)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Live (non-deleted) row for `key`.
    pub async fn get_object(&self, key: &str) -> StorageResult<Option<StorageObject>> {
        let row = sqlx::query_as::<_, StorageObjectRow>(&format!(
            "SELECT {} FROM storage_objects WHERE key = ? AND is_deleted = 0",
            OBJECT_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StorageObjectRow::into_object))
    }

    /// Row by identifier, including soft-deleted rows.
    pub async fn get_object_by_id(&self, object_id: Uuid) -> StorageResult<Option<StorageObject>> {
        let row = sqlx::query_as::<_, StorageObjectRow>(&format!(
            "SELECT {} FROM storage_objects WHERE object_id = ?",
            OBJECT_COLUMNS
        ))
        .bind(object_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(StorageObjectRow::into_object))
    }

    /// Live rows whose key starts with the literal `prefix`, ordered by key.
    ///
    /// Matching uses `substr`, not `LIKE`, so `%`, `_` and letter case in
    /// the prefix are matched exactly.
    pub async fn list_objects(
        &self,
        prefix: &str,
        limit: i64,
        stage: Option<LifecycleStage>,
    ) -> StorageResult<Vec<StorageObject>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM storage_objects WHERE is_deleted = 0",
            OBJECT_COLUMNS
        ));
        if !prefix.is_empty() {
            builder.push(" AND substr(key, 1, length(");
            builder.push_bind(prefix.to_string());
            builder.push(")) = ");
            builder.push_bind(prefix.to_string());
        }
        if let Some(stage) = stage {
            builder.push(" AND lifecycle_stage = ");
            builder.push_bind(stage.as_str());
        }
        builder.push(" ORDER BY key ASC LIMIT ");
        builder.push_bind(limit.max(0));

        let rows: Vec<StorageObjectRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(StorageObjectRow::into_object).collect())
    }

    /// Bump `access_count` and stamp `last_accessed` in one statement.
    pub async fn update_access_stats(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_objects
             SET access_count = access_count + 1, last_accessed = ?
             WHERE key = ? AND is_deleted = 0",
        )
        .bind(Utc::now())
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Live rows in `stage` last accessed before `cutoff`, oldest first.
    pub async fn get_lifecycle_candidates(
        &self,
        stage: LifecycleStage,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> StorageResult<Vec<StorageObject>> {
        let rows = sqlx::query_as::<_, StorageObjectRow>(&format!(
            "SELECT {} FROM storage_objects
             WHERE is_deleted = 0 AND lifecycle_stage = ? AND last_accessed < ?
             ORDER BY last_accessed ASC
             LIMIT ?",
            OBJECT_COLUMNS
        ))
        .bind(stage.as_str())
        .bind(cutoff)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StorageObjectRow::into_object).collect())
    }

    /// Move a row from `from` to `to`. Applies only while the row is still
    /// live and still in `from`, so a stage never moves backward.
    pub async fn advance_lifecycle(
        &self,
        object_id: Uuid,
        from: LifecycleStage,
        to: LifecycleStage,
        next_transition_date: Option<DateTime<Utc>>,
    ) -> StorageResult<bool> {
        if to <= from {
            warn!(%object_id, %from, %to, "refusing non-forward lifecycle transition");
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE storage_objects
             SET lifecycle_stage = ?, next_transition_date = ?
             WHERE object_id = ? AND lifecycle_stage = ? AND is_deleted = 0",
        )
        .bind(to.as_str())
        .bind(next_transition_date)
        .bind(object_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Soft-delete a row. Returns false if it was already deleted or absent.
    pub async fn mark_deleted(&self, object_id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE storage_objects SET is_deleted = 1 WHERE object_id = ? AND is_deleted = 0",
        )
        .bind(object_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_objects(&self) -> StorageResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM storage_objects WHERE is_deleted = 0")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn stage_summary(&self) -> StorageResult<Vec<StageSummary>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT lifecycle_stage, COUNT(*), COALESCE(SUM(size_bytes), 0)
             FROM storage_objects WHERE is_deleted = 0
             GROUP BY lifecycle_stage",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = Vec::with_capacity(rows.len());
        for (label, objects, bytes) in rows {
            match label.parse::<LifecycleStage>() {
                Ok(stage) => summary.push(StageSummary { stage, objects, bytes }),
                Err(err) => warn!(error = %err, "skipping rows with unknown lifecycle stage"),
            }
        }
        Ok(summary)
    }

    /// Key, hash and dedup reference of every live row.
    pub async fn live_content_entries(&self) -> StorageResult<Vec<ContentEntry>> {
        let entries = sqlx::query_as::<_, ContentEntry>(
            "SELECT key, content_hash, dedup_reference
             FROM storage_objects WHERE is_deleted = 0",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Live rows whose payload is stored under `holder`.
    pub async fn find_referrers(&self, holder: &str) -> StorageResult<Vec<StorageObject>> {
        let rows = sqlx::query_as::<_, StorageObjectRow>(&format!(
            "SELECT {} FROM storage_objects
             WHERE is_deleted = 0 AND dedup_reference = ?
             ORDER BY created_at ASC, key ASC",
            OBJECT_COLUMNS
        ))
        .bind(holder)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StorageObjectRow::into_object).collect())
    }

    /// Point every live referrer of `from` at `to`; the row for `to` itself
    /// becomes a holder (its reference is cleared).
    /// Make `to` the holder of the payload previously held by `from`.
    ///
    /// In one transaction: every live referrer of `from` is pointed at `to`,
    /// `to` itself stops being a reference, and `to` records the backends
    /// now storing the copy. Returns the number of referrer rows moved.
    pub async fn repoint_referrers(
        &self,
        from: &str,
        to: &str,
        locations: &[String],
        status: ReplicationStatus,
    ) -> StorageResult<u64> {
        let locations = serde_json::to_string(locations)?;
        let mut tx = self.pool.begin().await?;

        let moved = sqlx::query(
            "UPDATE storage_objects
             SET dedup_reference = CASE WHEN key = ? THEN NULL ELSE ? END
             WHERE dedup_reference = ? AND is_deleted = 0",
        )
        .bind(to)
        .bind(to)
        .bind(from)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "UPDATE storage_objects
             SET replica_locations = ?, replication_status = ?
             WHERE key = ? AND is_deleted = 0",
        )
        .bind(locations)
        .bind(status.as_str())
        .bind(to)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(moved)
    }

    pub async fn list_by_replication_status(
        &self,
        status: ReplicationStatus,
        limit: i64,
    ) -> StorageResult<Vec<StorageObject>> {
        let rows = sqlx::query_as::<_, StorageObjectRow>(&format!(
            "SELECT {} FROM storage_objects
             WHERE is_deleted = 0 AND replication_status = ?
             ORDER BY created_at ASC
             LIMIT ?",
            OBJECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StorageObjectRow::into_object).collect())
    }

    pub async fn health_check(&self) -> bool {
        matches!(
            sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&self.pool).await,
            Ok(1)
        )
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
