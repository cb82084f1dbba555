//! Represents one logical object tracked by the metadata catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::warn;
use uuid::Uuid;

/// Sensitivity label consumed by the permission collaborator.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataClassification {
    Public,
    #[default]
    Internal,
    Confidential,
    Restricted,
}

impl DataClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::Confidential => "confidential",
            Self::Restricted => "restricted",
        }
    }
}

/// Storage tier, ordered from most to least frequently accessed.
///
/// The derived ordering follows the tier sequence, so `a < b` means `a`
/// comes earlier in the hot → archive progression.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    #[default]
    Hot,
    Warm,
    Cold,
    Archive,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 4] = [Self::Hot, Self::Warm, Self::Cold, Self::Archive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Archive => "archive",
        }
    }

    /// The tier an object moves to next, or `None` once it reaches archive.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Hot => Some(Self::Warm),
            Self::Warm => Some(Self::Cold),
            Self::Cold => Some(Self::Archive),
            Self::Archive => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationStatus {
    #[default]
    Pending,
    Partial,
    Complete,
}

impl ReplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Complete => "complete",
        }
    }
}

macro_rules! text_enum {
    ($ty:ident, $label:literal, [$($variant:ident),+]) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $(v if v == $ty::$variant.as_str() => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} `{}`", $label, other)),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(DataClassification, "classification", [Public, Internal, Confidential, Restricted]);
text_enum!(LifecycleStage, "lifecycle stage", [Hot, Warm, Cold, Archive]);
text_enum!(ReplicationStatus, "replication status", [Pending, Partial, Complete]);

/// Caller-supplied attributes for a write.
#[derive(Clone, Debug)]
pub struct ObjectOptions {
    /// MIME type of the payload.
    pub content_type: String,
    pub classification: DataClassification,
    /// Initial placement tier.
    pub storage_policy: LifecycleStage,
    pub custom_metadata: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
}

impl Default for ObjectOptions {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".into(),
            classification: DataClassification::default(),
            storage_policy: LifecycleStage::default(),
            custom_metadata: BTreeMap::new(),
            tags: BTreeSet::new(),
        }
    }
}

impl ObjectOptions {
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn classification(mut self, classification: DataClassification) -> Self {
        self.classification = classification;
        self
    }

    pub fn storage_policy(mut self, policy: LifecycleStage) -> Self {
        self.storage_policy = policy;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

/// Metadata for a single stored object.
///
/// Holds everything the engine knows about a key except the payload bytes,
/// which live on the storage backends.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StorageObject {
    /// Unique identifier, assigned once at creation and never reused.
    pub object_id: Uuid,

    /// Lookup handle; unique among non-deleted objects.
    pub key: String,

    /// Size of the caller's payload before compression.
    pub size_bytes: i64,

    pub content_type: String,

    /// SHA-256 (hex) of the bytes as persisted on the backends.
    pub content_hash: String,

    pub created_at: DateTime<Utc>,

    /// Updated on every successful read.
    pub last_accessed: DateTime<Utc>,

    pub access_count: i64,

    pub classification: DataClassification,

    /// Tier the object was placed in when written.
    pub storage_policy: LifecycleStage,

    /// Current tier; only ever moves forward.
    pub lifecycle_stage: LifecycleStage,

    /// When the next lifecycle sweep should consider this object.
    pub next_transition_date: Option<DateTime<Utc>>,

    /// Backend identifiers that hold a copy, in write order.
    pub replica_locations: Vec<String>,

    pub replication_status: ReplicationStatus,

    pub custom_metadata: BTreeMap<String, String>,

    pub tags: BTreeSet<String>,

    /// Incremented on every overwrite, starting at 1.
    pub version: i64,

    /// Whether the persisted bytes are compressed.
    pub is_compressed: bool,

    /// Key whose backend location holds this object's bytes, when the
    /// payload was deduplicated against another object.
    pub dedup_reference: Option<String>,

    /// Soft-delete marker. Deleted rows are kept for audit.
    pub is_deleted: bool,
}

impl StorageObject {
    /// Key under which the payload bytes live on the backends.
    pub fn storage_location(&self) -> &str {
        self.dedup_reference.as_deref().unwrap_or(&self.key)
    }
}

/// Flat row shape of the `storage_objects` table.
///
/// Enum and collection columns are stored as text and decoded by
/// [`StorageObjectRow::into_object`].
#[derive(FromRow, Debug)]
pub struct StorageObjectRow {
    pub object_id: Uuid,
    pub key: String,
    pub size_bytes: i64,
    pub content_type: String,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
    pub classification: String,
    pub storage_policy: String,
    pub lifecycle_stage: String,
    pub next_transition_date: Option<DateTime<Utc>>,
    pub replica_locations: String,
    pub replication_status: String,
    pub custom_metadata: String,
    pub tags: String,
    pub version: i64,
    pub is_compressed: bool,
    pub dedup_reference: Option<String>,
    pub is_deleted: bool,
}

impl StorageObjectRow {
    /// Decode text columns into typed fields.
    ///
    /// Malformed JSON or unknown enum labels are logged and replaced with
    /// empty / default values so one bad row never poisons a listing.
    pub fn into_object(self) -> StorageObject {
        let key = self.key;
        StorageObject {
            object_id: self.object_id,
            size_bytes: self.size_bytes,
            content_type: self.content_type,
            content_hash: self.content_hash,
            created_at: self.created_at,
            last_accessed: self.last_accessed,
            access_count: self.access_count,
            classification: decode_label(&key, "classification", &self.classification),
            storage_policy: decode_label(&key, "storage_policy", &self.storage_policy),
            lifecycle_stage: decode_label(&key, "lifecycle_stage", &self.lifecycle_stage),
            next_transition_date: self.next_transition_date,
            replica_locations: decode_json(&key, "replica_locations", &self.replica_locations),
            replication_status: decode_label(
                &key,
                "replication_status",
                &self.replication_status,
            ),
            custom_metadata: decode_json(&key, "custom_metadata", &self.custom_metadata),
            tags: decode_json(&key, "tags", &self.tags),
            version: self.version,
            is_compressed: self.is_compressed,
            dedup_reference: self.dedup_reference,
            is_deleted: self.is_deleted,
            key,
        }
    }
}

fn decode_json<T: serde::de::DeserializeOwned + Default>(key: &str, column: &str, raw: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(key, column, error = %err, "malformed metadata column, treating as empty");
            T::default()
        }
    }
}

fn decode_label<T: FromStr<Err = String> + Default>(key: &str, column: &str, raw: &str) -> T {
    match raw.parse() {
        Ok(value) => value,
        Err(err) => {
            warn!(key, column, error = %err, "unknown label, using default");
            T::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(tags: &str, custom: &str) -> StorageObjectRow {
        let now = Utc::now();
        StorageObjectRow {
            object_id: Uuid::new_v4(),
            key: "k".into(),
            size_bytes: 3,
            content_type: "text/plain".into(),
            content_hash: "abc".into(),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            classification: "confidential".into(),
            storage_policy: "warm".into(),
            lifecycle_stage: "cold".into(),
            next_transition_date: None,
            replica_locations: r#"["primary","replica_0"]"#.into(),
            replication_status: "partial".into(),
            custom_metadata: custom.into(),
            tags: tags.into(),
            version: 2,
            is_compressed: false,
            dedup_reference: None,
            is_deleted: false,
        }
    }

    #[test]
    fn stage_progression_is_forward_only() {
        assert_eq!(LifecycleStage::Hot.next(), Some(LifecycleStage::Warm));
        assert_eq!(LifecycleStage::Cold.next(), Some(LifecycleStage::Archive));
        assert_eq!(LifecycleStage::Archive.next(), None);
        assert!(LifecycleStage::Hot < LifecycleStage::Archive);
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!("HOT".parse::<LifecycleStage>().unwrap(), LifecycleStage::Hot);
        assert_eq!(
            "Restricted".parse::<DataClassification>().unwrap(),
            DataClassification::Restricted
        );
        assert!("lukewarm".parse::<LifecycleStage>().is_err());
        assert_eq!(ReplicationStatus::Complete.to_string(), "complete");
    }

    #[test]
    fn row_decodes_typed_fields() {
        let obj = row(r#"["a","b"]"#, r#"{"owner":"ops"}"#).into_object();
        assert_eq!(obj.classification, DataClassification::Confidential);
        assert_eq!(obj.lifecycle_stage, LifecycleStage::Cold);
        assert_eq!(obj.replica_locations, vec!["primary", "replica_0"]);
        assert_eq!(obj.replication_status, ReplicationStatus::Partial);
        assert!(obj.tags.contains("a") && obj.tags.contains("b"));
        assert_eq!(obj.custom_metadata.get("owner").map(String::as_str), Some("ops"));
    }

    #[test]
    fn malformed_json_columns_decode_as_empty() {
        let obj = row("not json", "{broken").into_object();
        assert!(obj.tags.is_empty());
        assert!(obj.custom_metadata.is_empty());
        assert_eq!(obj.key, "k");
    }

    #[test]
    fn storage_location_prefers_dedup_reference() {
        let mut obj = row("[]", "{}").into_object();
        assert_eq!(obj.storage_location(), "k");
        obj.dedup_reference = Some("original".into());
        assert_eq!(obj.storage_location(), "original");
    }
}
