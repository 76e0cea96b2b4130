//! Blob store traits and the scheme mux.
//!
//! A [`Bucket`] is a flat key space inside one named bucket; a
//! [`BlobStore`] resolves bucket names for one URL scheme; a [`Mux`]
//! routes `scheme://bucket/key` URLs to the right store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use flow_core::{Digest, Error, ErrorKind};

/// Metadata for one stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Content digest, when the store exposes one (e.g. object
    /// metadata written at upload time). Enables fetch skipping.
    pub sha256: Option<Digest>,
}

#[async_trait]
pub trait Bucket: Send + Sync {
    /// The bucket's name.
    fn name(&self) -> &str;

    /// Metadata for an exact key. `NotExist` when absent.
    async fn head(&self, key: &str) -> Result<BlobObject, Error>;

    /// Fetch an object's metadata and bytes.
    async fn get(&self, key: &str) -> Result<(BlobObject, Bytes), Error>;

    /// Store bytes under a key.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), Error>;

    /// All objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, Error>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error>;
}

/// A parsed `scheme://bucket/key` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUrl {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl BlobUrl {
    pub fn parse(url: &str) -> Result<BlobUrl, Error> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            Error::fatal("blob url", format!("{url:?}: missing scheme"))
        })?;
        if scheme.is_empty() {
            return Err(Error::fatal("blob url", format!("{url:?}: empty scheme")));
        }
        let (bucket, key) = match rest.split_once('/') {
            Some((b, k)) => (b, k),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(Error::fatal("blob url", format!("{url:?}: empty bucket")));
        }
        Ok(BlobUrl {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// The source URL of an object under this bucket.
    pub fn source_of(&self, key: &str) -> String {
        format!("{}://{}/{}", self.scheme, self.bucket, key)
    }
}

/// Routes URLs to stores by scheme.
#[derive(Default, Clone)]
pub struct Mux {
    stores: BTreeMap<String, Arc<dyn BlobStore>>,
}

impl Mux {
    pub fn new() -> Self {
        Mux::default()
    }

    pub fn insert(&mut self, scheme: impl Into<String>, store: Arc<dyn BlobStore>) {
        self.stores.insert(scheme.into(), store);
    }

    /// Resolve a URL to its bucket and in-bucket key (or prefix).
    pub async fn bucket(&self, url: &str) -> Result<(Arc<dyn Bucket>, BlobUrl), Error> {
        let parsed = BlobUrl::parse(url)?;
        let store = self.stores.get(&parsed.scheme).ok_or_else(|| {
            Error::new(
                ErrorKind::NotExist,
                "blob mux",
                format!("no store registered for scheme {:?}", parsed.scheme),
            )
        })?;
        let bucket = store.bucket(&parsed.bucket).await?;
        Ok((bucket, parsed))
    }
}
