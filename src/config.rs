use crate::errors::{StorageError, StorageResult};
use crate::models::object::LifecycleStage;
use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Storage medium behind a backend slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Memory,
    S3,
    Azure,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "filesystem" | "local_filesystem" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            other => Err(format!("unknown backend kind `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStrategy {
    #[default]
    None,
    Sync,
    Async,
}

impl FromStr for ReplicationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            other => Err(format!("unknown replication strategy `{}`", other)),
        }
    }
}

/// Credentials for cloud backends. Carried for completeness; no cloud
/// backend is implemented.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub azure_container: Option<String>,
    #[serde(skip_serializing)]
    pub azure_connection_string: Option<String>,
}

// Hand-written so the connection string never reaches logs.
impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_region", &self.s3_region)
            .field("azure_container", &self.azure_container)
            .field(
                "azure_connection_string",
                &self.azure_connection_string.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Immutable configuration snapshot handed to the storage manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub primary_backend: BackendKind,
    pub base_path: PathBuf,
    /// Defaults to `sqlite://<base_path>/.metadata/catalog.db`.
    pub metadata_db_url: Option<String>,
    pub metadata_max_connections: u32,

    pub replication_strategy: ReplicationStrategy,
    /// Copies (primary included) required for `complete` replication.
    pub replication_factor: usize,
    pub replica_backends: Vec<BackendKind>,

    pub chunk_size_bytes: usize,
    pub compression_enabled: bool,
    pub compression_level: u32,
    pub encryption_enabled: bool,
    pub deduplication_enabled: bool,

    pub enable_lifecycle_management: bool,
    pub hot_to_warm_days: i64,
    pub warm_to_cold_days: i64,
    pub cold_to_archive_days: i64,
    pub archive_retention_days: i64,
    pub lifecycle_interval_seconds: u64,
    pub lifecycle_batch_size: i64,
    pub lifecycle_max_batches: usize,

    pub backup_enabled: bool,
    pub backup_interval_hours: u64,
    pub backup_retention_days: u64,

    /// Zero disables the health loop.
    pub health_check_interval_seconds: u64,
    /// Deadline applied to every individual backend call.
    pub backend_timeout_seconds: u64,

    pub cloud: CloudCredentials,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_backend: BackendKind::Local,
            base_path: PathBuf::from("./data/objects"),
            metadata_db_url: None,
            metadata_max_connections: 5,
            replication_strategy: ReplicationStrategy::None,
            replication_factor: 1,
            replica_backends: Vec::new(),
            chunk_size_bytes: 4 * 1024 * 1024,
            compression_enabled: true,
            compression_level: 6,
            encryption_enabled: false,
            deduplication_enabled: true,
            enable_lifecycle_management: true,
            hot_to_warm_days: 30,
            warm_to_cold_days: 90,
            cold_to_archive_days: 365,
            archive_retention_days: 2555,
            lifecycle_interval_seconds: 3600,
            lifecycle_batch_size: 100,
            lifecycle_max_batches: 10,
            backup_enabled: false,
            backup_interval_hours: 24,
            backup_retention_days: 30,
            health_check_interval_seconds: 60,
            backend_timeout_seconds: 30,
            cloud: CloudCredentials::default(),
        }
    }
}

impl StorageConfig {
    /// Configuration rooted at `base_path` with everything else defaulted.
    pub fn with_base_path(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            ..Self::default()
        }
    }

    pub fn metadata_url(&self) -> String {
        self.metadata_db_url.clone().unwrap_or_else(|| {
            format!(
                "sqlite://{}",
                self.base_path.join(".metadata").join("catalog.db").display()
            )
        })
    }

    /// Idle days after which an object in `stage` becomes a transition
    /// candidate. For archive this is the retention period.
    pub fn threshold_days(&self, stage: LifecycleStage) -> i64 {
        match stage {
            LifecycleStage::Hot => self.hot_to_warm_days,
            LifecycleStage::Warm => self.warm_to_cold_days,
            LifecycleStage::Cold => self.cold_to_archive_days,
            LifecycleStage::Archive => self.archive_retention_days,
        }
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_seconds.max(1))
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.replication_factor == 0 {
            return Err(StorageError::Config(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.compression_level > 9 {
            return Err(StorageError::Config(
                "compression_level must be between 0 and 9".into(),
            ));
        }
        if self.lifecycle_batch_size <= 0 || self.lifecycle_max_batches == 0 {
            return Err(StorageError::Config(
                "lifecycle batch size and batch count must be positive".into(),
            ));
        }
        if self.chunk_size_bytes == 0 {
            return Err(StorageError::Config("chunk_size_bytes must be positive".into()));
        }
        let thresholds = [
            self.hot_to_warm_days,
            self.warm_to_cold_days,
            self.cold_to_archive_days,
            self.archive_retention_days,
        ];
        if thresholds.iter().any(|days| *days < 0) {
            return Err(StorageError::Config(
                "lifecycle thresholds cannot be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Command-line + environment configuration for the daemon.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Distributed storage coordination engine")]
pub struct Args {
    /// Root directory for object payloads (overrides DIST_STORAGE_BASE_PATH)
    #[arg(long)]
    pub base_path: Option<PathBuf>,

    /// Metadata database URL (overrides DIST_STORAGE_METADATA_DB_URL)
    #[arg(long)]
    pub metadata_db_url: Option<String>,

    /// Primary backend kind (overrides DIST_STORAGE_PRIMARY_BACKEND)
    #[arg(long)]
    pub primary_backend: Option<String>,

    /// none | sync | async (overrides DIST_STORAGE_REPLICATION_STRATEGY)
    #[arg(long)]
    pub replication_strategy: Option<String>,

    /// Required copies including the primary (overrides DIST_STORAGE_REPLICATION_FACTOR)
    #[arg(long)]
    pub replication_factor: Option<usize>,

    /// Comma-separated replica backend kinds (overrides DIST_STORAGE_REPLICA_BACKENDS)
    #[arg(long)]
    pub replica_backends: Option<String>,

    /// Disable payload compression
    #[arg(long)]
    pub no_compression: bool,

    /// Disable content deduplication
    #[arg(long)]
    pub no_dedup: bool,

    /// Disable the lifecycle sweep
    #[arg(long)]
    pub no_lifecycle: bool,

    /// Seconds between lifecycle sweeps (overrides DIST_STORAGE_LIFECYCLE_INTERVAL)
    #[arg(long)]
    pub lifecycle_interval: Option<u64>,

    /// Seconds between backend health checks (overrides DIST_STORAGE_HEALTH_INTERVAL)
    #[arg(long)]
    pub health_interval: Option<u64>,

    /// Apply the metadata schema and exit
    #[arg(long)]
    pub migrate: bool,
}

impl StorageConfig {
    /// Parse CLI args and `DIST_STORAGE_*` environment variables into a
    /// configuration. CLI values win over the environment. The returned flag
    /// is set when `--migrate` was passed.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge parsed args over environment lookups over defaults.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(path) = args.base_path.or_else(|| lookup("DIST_STORAGE_BASE_PATH").map(PathBuf::from)) {
            cfg.base_path = path;
        }
        cfg.metadata_db_url = args
            .metadata_db_url
            .or_else(|| lookup("DIST_STORAGE_METADATA_DB_URL"));

        if let Some(kind) = args
            .primary_backend
            .or_else(|| lookup("DIST_STORAGE_PRIMARY_BACKEND"))
        {
            cfg.primary_backend = parse_value("DIST_STORAGE_PRIMARY_BACKEND", &kind)?;
        }
        if let Some(strategy) = args
            .replication_strategy
            .or_else(|| lookup("DIST_STORAGE_REPLICATION_STRATEGY"))
        {
            cfg.replication_strategy = parse_value("DIST_STORAGE_REPLICATION_STRATEGY", &strategy)?;
        }
        match args.replication_factor {
            Some(factor) => cfg.replication_factor = factor,
            None => {
                if let Some(raw) = lookup("DIST_STORAGE_REPLICATION_FACTOR") {
                    cfg.replication_factor = raw.parse().with_context(|| {
                        format!("parsing DIST_STORAGE_REPLICATION_FACTOR value `{}`", raw)
                    })?;
                }
            }
        }
        if let Some(list) = args
            .replica_backends
            .or_else(|| lookup("DIST_STORAGE_REPLICA_BACKENDS"))
        {
            cfg.replica_backends = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|kind| parse_value("DIST_STORAGE_REPLICA_BACKENDS", kind))
                .collect::<Result<_>>()?;
        }

        cfg.compression_enabled = !args.no_compression;
        cfg.deduplication_enabled = !args.no_dedup;
        cfg.enable_lifecycle_management = !args.no_lifecycle;

        if let Some(secs) = args.lifecycle_interval {
            cfg.lifecycle_interval_seconds = secs;
        } else if let Some(raw) = lookup("DIST_STORAGE_LIFECYCLE_INTERVAL") {
            cfg.lifecycle_interval_seconds = raw
                .parse()
                .with_context(|| format!("parsing DIST_STORAGE_LIFECYCLE_INTERVAL value `{}`", raw))?;
        }
        if let Some(secs) = args.health_interval {
            cfg.health_check_interval_seconds = secs;
        } else if let Some(raw) = lookup("DIST_STORAGE_HEALTH_INTERVAL") {
            cfg.health_check_interval_seconds = raw
                .parse()
                .with_context(|| format!("parsing DIST_STORAGE_HEALTH_INTERVAL value `{}`", raw))?;
        }

        cfg.cloud.s3_bucket = lookup("DIST_STORAGE_S3_BUCKET");
        cfg.cloud.s3_region = lookup("DIST_STORAGE_S3_REGION");
        cfg.cloud.azure_container = lookup("DIST_STORAGE_AZURE_CONTAINER");
        cfg.cloud.azure_connection_string = lookup("DIST_STORAGE_AZURE_CONNECTION_STRING");

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_value<T: FromStr<Err = String>>(name: &str, raw: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("parsing {} value `{}`", name, raw))
}
