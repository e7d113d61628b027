//! Represents an object (document) stored in a bucket, its tags, and the
//! processor-version marker written after cleansing.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Tag key recording which processor version cleansed an object.
pub const PROCESSOR_VERSION_TAG: &str = "DOCUMENT_PROCESSOR_VERSION";

/// Version written into [`PROCESSOR_VERSION_TAG`]. Must stay URI-safe since
/// S3 receives tags as a form-encoded query string.
pub const PROCESSOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Most tags S3 accepts on one object.
pub const MAX_OBJECT_TAGS: usize = 10;

/// Metadata row for an object held by the local store.
///
/// The payload lives on disk; this row only describes it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ObjectRecord {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Content type (MIME type) declared on the last write.
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 of the payload.
    pub etag: String,

    /// Timestamp when object was last written.
    pub last_modified: DateTime<Utc>,
}

/// An object as read back from any store backend.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Key/value tags attached to an object, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectTags(BTreeMap<String, String>);

impl ObjectTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The processor version recorded on the object, if any.
    pub fn processor_version(&self) -> Option<&str> {
        self.get(PROCESSOR_VERSION_TAG)
    }

    /// Existing tags plus the marker for the running processor version.
    ///
    /// The marker always survives. When the result would exceed
    /// [`MAX_OBJECT_TAGS`], the last existing tags in key order are dropped
    /// and their keys returned.
    pub fn with_processor_version(mut self) -> (Self, Vec<String>) {
        self.0.remove(PROCESSOR_VERSION_TAG);
        let mut dropped = Vec::new();
        while self.0.len() >= MAX_OBJECT_TAGS {
            if let Some((key, _)) = self.0.pop_last() {
                dropped.push(key);
            }
        }
        dropped.reverse();
        self.insert(PROCESSOR_VERSION_TAG, PROCESSOR_VERSION);
        (self, dropped)
    }

    /// Encode as the `k=v&k=v` query string S3 expects in `x-amz-tagging`.
    pub fn to_query_string(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl FromIterator<(String, String)> for ObjectTags {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of comparing an object's recorded processor version with ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    /// Same major version; the object does not need processing again.
    Compatible,
    /// Different major version; reprocess.
    Incompatible,
    /// Either side has no numeric major component; reprocess to be safe.
    Unparseable,
}

/// Compare two semver-like strings by major component only.
pub fn compare_versions(existing: &str, current: &str) -> VersionCheck {
    match (major_version(existing), major_version(current)) {
        (Some(a), Some(b)) if a == b => VersionCheck::Compatible,
        (Some(_), Some(_)) => VersionCheck::Incompatible,
        _ => VersionCheck::Unparseable,
    }
}

fn major_version(version: &str) -> Option<u64> {
    version.trim().split('.').next()?.parse().ok()
}
