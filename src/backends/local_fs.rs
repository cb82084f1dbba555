//! Local directory-tree backend.
//!
//! Payloads live at `root/<key segments>`; metadata for each key is a JSON
//! sidecar at `root/.metadata/<sanitized key>.meta`. Writes go to a staging
//! file first and are renamed into place after an fsync.

use crate::backends::{
    BackendMetadata, REPLICA_SEGMENT, RESERVED_SEGMENT, StorageBackend, validate_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const SIDECAR_EXT: &str = "meta";
/// Sanitized names longer than this fall back to an MD5 digest of the key.
const MAX_SIDECAR_NAME: usize = 200;

#[derive(Serialize, Deserialize, Debug)]
struct Sidecar {
    key: String,
    size: u64,
    etag: String,
    stored_at: DateTime<Utc>,
    metadata: BackendMetadata,
}

pub struct LocalFilesystemBackend {
    id: String,
    root: PathBuf,
    chunk_size: usize,
}

impl LocalFilesystemBackend {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self {
            id: id.into(),
            root: root.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_dir(&self) -> PathBuf {
        self.root.join(RESERVED_SEGMENT)
    }

    fn staging_dir(&self) -> PathBuf {
        self.metadata_dir().join(STAGING_DIR)
    }

    /// Translate a key's `/` separators into a path under `root`.
    fn object_path(&self, key: &str) -> Option<PathBuf> {
        if let Err(reason) = validate_key(key) {
            warn!(backend = %self.id, key, %reason, "refusing unsafe key");
            return None;
        }
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        Some(path)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.metadata_dir()
            .join(format!("{}.{}", sanitize_key(key), SIDECAR_EXT))
    }

    /// Stage `data` in chunks, fsync, then atomically rename into place.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other("object path missing parent directory"))?;
        fs::create_dir_all(parent).await?;
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;

        let tmp_path = staging.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let written = async {
            for chunk in data.chunks(self.chunk_size) {
                file.write_all(chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn write_sidecar(&self, key: &str, data: &[u8], metadata: &BackendMetadata) -> io::Result<()> {
        let sidecar = Sidecar {
            key: key.to_string(),
            size: data.len() as u64,
            etag: format!("{:x}", md5::compute(data)),
            stored_at: Utc::now(),
            metadata: metadata.clone(),
        };
        let json = serde_json::to_vec_pretty(&sidecar).map_err(io::Error::other)?;
        self.write_atomic(&self.sidecar_path(key), &json).await
    }

    /// Remove empty directories from `start` upward, stopping at `root`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Depth-first walk collecting keys, skipping the reserved top-level trees.
    async fn walk_keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if dir == self.root
                        && (entry.file_name() == RESERVED_SEGMENT
                            || entry.file_name() == REPLICA_SEGMENT)
                    {
                        continue;
                    }
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Some(key) = self.key_for_path(&path) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn key_for_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments = relative
            .components()
            .map(|c| c.as_os_str().to_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }
}

/// Filesystem-safe, collision-free sidecar name for `key`.
///
/// Bytes outside `[A-Za-z0-9._-]` are percent-encoded; overlong results are
/// replaced by the key's MD5 digest.
fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    if out.len() > MAX_SIDECAR_NAME {
        return format!("md5-{:x}", md5::compute(key));
    }
    out
}

#[async_trait]
impl StorageBackend for LocalFilesystemBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &BackendMetadata) -> bool {
        let Some(path) = self.object_path(key) else {
            return false;
        };
        if let Err(err) = self.write_atomic(&path, &data).await {
            error!(backend = %self.id, key, error = %err, "payload write failed");
            return false;
        }
        if let Err(err) = self.write_sidecar(key, &data, metadata).await {
            error!(backend = %self.id, key, error = %err, "metadata sidecar write failed");
            return false;
        }
        debug!(backend = %self.id, key, bytes = data.len(), "stored payload");
        true
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(backend = %self.id, key, "payload missing");
                None
            }
            Err(err) => {
                error!(backend = %self.id, key, error = %err, "payload read failed");
                None
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let Some(path) = self.object_path(key) else {
            return false;
        };
        let existed = match fs::remove_file(&path).await {
            Ok(_) => {
                debug!("removed physical file {}", path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                false
            }
            Err(err) => {
                error!(backend = %self.id, key, error = %err, "payload delete failed");
                return false;
            }
        };

        match fs::remove_file(self.sidecar_path(key)).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(backend = %self.id, key, error = %err, "sidecar delete failed"),
        }

        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        existed
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(path) = self.object_path(key) else {
            return false;
        };
        match fs::metadata(&path).await {
            Ok(meta) => meta.is_file(),
            Err(_) => false,
        }
    }

    async fn list_keys(&self, prefix: &str) -> Vec<String> {
        match self.walk_keys().await {
            Ok(keys) => keys.into_iter().filter(|k| k.starts_with(prefix)).collect(),
            Err(err) => {
                error!(backend = %self.id, prefix, error = %err, "listing failed");
                Vec::new()
            }
        }
    }

    async fn get_metadata(&self, key: &str) -> Option<BackendMetadata> {
        let raw = match fs::read(self.sidecar_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                error!(backend = %self.id, key, error = %err, "sidecar read failed");
                return None;
            }
        };
        let sidecar: Sidecar = match serde_json::from_slice(&raw) {
            Ok(sidecar) => sidecar,
            Err(err) => {
                warn!(backend = %self.id, key, error = %err, "malformed sidecar, treating as empty");
                return Some(BackendMetadata::new());
            }
        };
        let mut metadata = sidecar.metadata;
        metadata.insert("size".into(), sidecar.size.to_string());
        metadata.insert("etag".into(), sidecar.etag);
        metadata.insert("stored_at".into(), sidecar.stored_at.to_rfc3339());
        Some(metadata)
    }
}
