//! In-memory content-hash index used for deduplication.
//!
//! Maps a content hash to the key whose backend location physically holds
//! the payload (the holder) and every live key sharing that payload. The
//! index is per-process and rebuilt from the catalog at startup.

use crate::services::metadata_store::ContentEntry;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    /// Key under which the bytes are stored on the backends.
    pub holder: String,
    /// All live keys with this hash, holder included.
    pub keys: BTreeSet<String>,
}

#[derive(Default)]
pub struct ContentIndex {
    entries: Mutex<HashMap<String, DedupEntry>>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the index with the given catalog rows.
    pub fn rebuild(&self, rows: impl IntoIterator<Item = ContentEntry>) {
        let mut entries = self.entries.lock();
        entries.clear();
        for row in rows {
            let holder = row.dedup_reference.unwrap_or_else(|| row.key.clone());
            let entry = entries
                .entry(row.content_hash)
                .or_insert_with(|| DedupEntry {
                    holder: holder.clone(),
                    keys: BTreeSet::new(),
                });
            // A row that holds its own bytes wins over a reference.
            if holder == row.key {
                entry.holder = holder;
            }
            entry.keys.insert(row.key);
        }
    }

    /// Holder of `hash`, ignoring an entry whose only key is `exclude`.
    pub fn holder_for(&self, hash: &str, exclude: &str) -> Option<String> {
        let entries = self.entries.lock();
        let entry = entries.get(hash)?;
        if entry.holder == exclude || entry.keys.iter().all(|k| k == exclude) {
            return None;
        }
        Some(entry.holder.clone())
    }

    /// Record `key` as a member of `hash`. The first key becomes the holder.
    pub fn insert(&self, hash: &str, key: &str) {
        let mut entries = self.entries.lock();
        entries
            .entry(hash.to_string())
            .or_insert_with(|| DedupEntry {
                holder: key.to_string(),
                keys: BTreeSet::new(),
            })
            .keys
            .insert(key.to_string());
    }

    /// Drop `key` from `hash`. If `key` was the holder and other keys
    /// remain, the smallest remaining key stands in until [`set_holder`]
    /// says otherwise.
    ///
    /// [`set_holder`]: ContentIndex::set_holder
    pub fn release(&self, hash: &str, key: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(hash) else {
            return;
        };
        entry.keys.remove(key);
        if entry.keys.is_empty() {
            entries.remove(hash);
        } else if entry.holder == key {
            if let Some(first) = entry.keys.iter().next().cloned() {
                entry.holder = first;
            }
        }
    }

    /// Record that `holder` now stores the bytes for `hash`.
    pub fn set_holder(&self, hash: &str, holder: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(hash.to_string())
            .or_insert_with(|| DedupEntry {
                holder: holder.to_string(),
                keys: BTreeSet::new(),
            });
        entry.holder = holder.to_string();
        entry.keys.insert(holder.to_string());
    }
}
