//! Storage medium abstraction.
//!
//! Every medium implements [`StorageBackend`]. Implementations catch and log
//! their own I/O errors and answer with sentinels (`false` / `None` / empty)
//! so the manager can treat heterogeneous media uniformly: fall back to a
//! replica on a failed read, fail the call on a failed primary write.

pub mod local_fs;
pub mod memory;

use crate::config::BackendKind;
use crate::errors::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use local_fs::LocalFilesystemBackend;
pub use memory::MemoryBackend;

/// Free-form string metadata stored next to a payload.
pub type BackendMetadata = BTreeMap<String, String>;

const MAX_KEY_LEN: usize = 1024;

/// First path segment reserved for backend bookkeeping (sidecars, staging
/// files and the default catalog database).
pub const RESERVED_SEGMENT: &str = ".metadata";

/// First path segment under which local replicas of a filesystem primary live.
pub const REPLICA_SEGMENT: &str = ".replicas";

const HEALTH_CHECK_PREFIX: &str = "__health_check__";
const HEALTH_CHECK_PAYLOAD: &[u8] = b"health-check-payload";

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Identifier recorded in `replica_locations` (e.g. `primary`, `replica_0`).
    fn id(&self) -> &str;

    /// Store `data` under `key`, replacing any previous payload.
    async fn put(&self, key: &str, data: Bytes, metadata: &BackendMetadata) -> bool;

    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Remove `key`. Returns true iff an object existed.
    async fn delete(&self, key: &str) -> bool;

    async fn exists(&self, key: &str) -> bool;

    /// Keys starting with the literal `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Vec<String>;

    async fn get_metadata(&self, key: &str) -> Option<BackendMetadata>;

    /// Synthetic put/get/delete round trip on a throwaway key.
    ///
    /// Healthy only if the bytes read back are identical to those written.
    async fn health_check(&self) -> bool {
        let key = format!("{}/{}", HEALTH_CHECK_PREFIX, Uuid::new_v4());
        let payload = Bytes::from_static(HEALTH_CHECK_PAYLOAD);

        if !self.put(&key, payload.clone(), &BackendMetadata::new()).await {
            warn!(backend = self.id(), "health check write failed");
            return false;
        }
        let round_trip = self.get(&key).await;
        let removed = self.delete(&key).await;
        let healthy = round_trip.as_deref() == Some(HEALTH_CHECK_PAYLOAD) && removed;
        debug!(backend = self.id(), healthy, "health check finished");
        healthy
    }
}

/// Reject keys that cannot be mapped safely onto a hierarchical medium.
pub fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key is empty".into());
    }
    if key.len() > MAX_KEY_LEN {
        return Err(format!("key exceeds {} bytes", MAX_KEY_LEN));
    }
    if key.starts_with('/') {
        return Err("key cannot start with `/`".into());
    }
    if key.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err("key contains control characters or backslashes".into());
    }
    let mut segments = key.split('/');
    if let Some(first) = segments.clone().next() {
        if first == RESERVED_SEGMENT || first == REPLICA_SEGMENT {
            return Err(format!("`{}` is a reserved prefix", first));
        }
    }
    if segments.any(|s| s.is_empty() || s == "." || s == "..") {
        return Err("key contains an empty, `.` or `..` segment".into());
    }
    Ok(())
}

/// Build the backend for one configured slot.
///
/// `root` is the directory a filesystem medium should own; other media
/// ignore it.
pub fn build_backend(
    kind: BackendKind,
    id: impl Into<String>,
    root: PathBuf,
    chunk_size: usize,
) -> StorageResult<Arc<dyn StorageBackend>> {
    let id = id.into();
    match kind {
        BackendKind::Local => Ok(Arc::new(LocalFilesystemBackend::new(id, root, chunk_size))),
        BackendKind::Memory => Ok(Arc::new(MemoryBackend::new(id))),
        BackendKind::S3 | BackendKind::Azure => Err(StorageError::Config(format!(
            "backend `{:?}` for `{}` is not implemented",
            kind, id
        ))),
    }
}
