//! Files, filesets and provenance assertions.
//!
//! A [`Fileset`] maps path strings to [`File`] records. A single-file
//! fileset uses the distinguished key `"."`. Each file fetched from a
//! blob store carries [`Assertions`] binding its content id to the
//! provenance attributes observed at fetch time.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// The key used for single-file filesets.
pub const SINGLE_KEY: &str = ".";

/// A file record: content identity plus optional blob provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    /// Content digest of the file's bytes.
    pub id: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Source URL (`scheme://bucket/key`), when fetched from a blob store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Blob-store ETag at fetch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Blob-store last-modified time at fetch time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    /// Tamper-evident provenance assertions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assertions: Option<Assertions>,
}

impl File {
    /// A bare file with only identity and size.
    pub fn new(id: Digest, size: u64) -> Self {
        File {
            id,
            size,
            source: None,
            etag: None,
            last_modified: None,
            assertions: None,
        }
    }
}

/// A set of named provenance properties bound to a content id.
///
/// Two assertion sets are equal iff every property matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Assertions(BTreeMap<String, String>);

impl Assertions {
    pub fn new() -> Self {
        Assertions::default()
    }

    /// Build the blob provenance assertions for a fetched file:
    /// source, etag, last-modified and size, keyed under the `blob`
    /// namespace.
    pub fn for_blob(file: &File) -> Self {
        let mut props = BTreeMap::new();
        if let Some(source) = &file.source {
            props.insert("blob:source".to_string(), source.clone());
        }
        if let Some(etag) = &file.etag {
            props.insert("blob:etag".to_string(), etag.clone());
        }
        if let Some(lm) = &file.last_modified {
            props.insert(
                "blob:last-modified".to_string(),
                lm.to_rfc3339_opts(SecondsFormat::Secs, true),
            );
        }
        props.insert("blob:size".to_string(), file.size.to_string());
        Assertions(props)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A mapping from path (or `"."`) to file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fileset {
    pub map: BTreeMap<String, File>,
}

impl Fileset {
    pub fn new() -> Self {
        Fileset::default()
    }

    /// A fileset holding exactly one file under the `"."` key.
    pub fn single(file: File) -> Self {
        let mut map = BTreeMap::new();
        map.insert(SINGLE_KEY.to_string(), file);
        Fileset { map }
    }

    /// Whether this is a single-file fileset (exactly one entry,
    /// keyed `"."`).
    pub fn is_single(&self) -> bool {
        self.map.len() == 1 && self.map.contains_key(SINGLE_KEY)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total size in bytes across all entries.
    pub fn size(&self) -> u64 {
        self.map.values().map(|f| f.size).sum()
    }
}
