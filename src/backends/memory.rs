//! In-process backend.
//!
//! Useful as a replica medium for single-host deployments and for failure
//! injection: [`MemoryBackend::set_available`] makes every call fail the way
//! an unreachable medium would.

use crate::backends::{BackendMetadata, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub struct MemoryBackend {
    id: String,
    objects: RwLock<BTreeMap<String, (Bytes, BackendMetadata)>>,
    available: AtomicBool,
}

impl MemoryBackend {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            objects: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn online(&self, op: &str, key: &str) -> bool {
        let up = self.available.load(Ordering::SeqCst);
        if !up {
            debug!(backend = %self.id, op, key, "backend unavailable");
        }
        up
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &BackendMetadata) -> bool {
        if !self.online("put", key) {
            return false;
        }
        self.objects
            .write()
            .insert(key.to_string(), (data, metadata.clone()));
        true
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        if !self.online("get", key) {
            return None;
        }
        self.objects.read().get(key).map(|(data, _)| data.clone())
    }

    async fn delete(&self, key: &str) -> bool {
        if !self.online("delete", key) {
            return false;
        }
        self.objects.write().remove(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        self.online("exists", key) && self.objects.read().contains_key(key)
    }

    async fn list_keys(&self, prefix: &str) -> Vec<String> {
        if !self.online("list", prefix) {
            return Vec::new();
        }
        self.objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    async fn get_metadata(&self, key: &str) -> Option<BackendMetadata> {
        if !self.online("get_metadata", key) {
            return None;
        }
        self.objects.read().get(key).map(|(_, meta)| meta.clone())
    }
}
