//! Distributed storage coordination engine.
//!
//! Payloads go to a primary backend plus optional replicas; a SQLite
//! catalog tracks every object's metadata, replication state and
//! lifecycle tier. Identical payloads are stored once.

pub mod backends;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use backends::{LocalFilesystemBackend, MemoryBackend, StorageBackend};
pub use config::{BackendKind, ReplicationStrategy, StorageConfig};
pub use errors::{Operation, StorageError, StorageResult};
pub use models::metrics::StorageMetrics;
pub use models::object::{
    DataClassification, LifecycleStage, ObjectOptions, ReplicationStatus, StorageObject,
};
pub use services::collaborators::{
    AllowAll, NoopTelemetry, PermissionChecker, TelemetrySink, TracingTelemetry,
};
pub use services::lifecycle::LifecycleReport;
pub use services::metadata_store::MetadataStore;
pub use services::storage_manager::DistributedStorageManager;
