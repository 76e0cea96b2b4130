//! In-memory blob store doubles.
//!
//! `TestBucket` records every `get` so tests can assert that
//! repository deduplication suppressed network fetches.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;

use flow_core::{Digest, Error};

use crate::store::{BlobObject, BlobStore, Bucket};

struct Stored {
    data: Bytes,
    etag: String,
    last_modified: chrono::DateTime<Utc>,
    sha256: Option<Digest>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, Stored>,
    get_log: Vec<String>,
    put_log: Vec<String>,
    fail_key: Option<String>,
}

/// An in-memory bucket.
pub struct TestBucket {
    name: String,
    inner: Mutex<Inner>,
}

impl TestBucket {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(TestBucket {
            name: name.to_string(),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Seed an object. When `with_sha256` is set, the object's
    /// content digest is exposed via metadata (as a store would for
    /// objects uploaded with a digest header).
    pub fn set_object(&self, key: &str, data: &[u8], with_sha256: bool) {
        let sha256 = with_sha256.then(|| Digest::from_bytes(data));
        let etag = Digest::from_bytes(data).hex_n(32).to_string();
        self.inner.lock().unwrap().objects.insert(
            key.to_string(),
            Stored {
                data: Bytes::copy_from_slice(data),
                etag,
                last_modified: Utc::now(),
                sha256,
            },
        );
    }

    /// Make `get` and `put` of one key fail with a temporary error.
    pub fn fail_key(&self, key: &str) {
        self.inner.lock().unwrap().fail_key = Some(key.to_string());
    }

    /// Keys fetched with `get` so far.
    pub fn get_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().get_log.clone()
    }

    /// Keys written with `put` so far.
    pub fn put_calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().put_log.clone()
    }

    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(key)
            .map(|s| s.data.clone())
    }

    fn object_of(key: &str, s: &Stored) -> BlobObject {
        BlobObject {
            key: key.to_string(),
            size: s.data.len() as u64,
            etag: Some(s.etag.clone()),
            last_modified: Some(s.last_modified),
            sha256: s.sha256.clone(),
        }
    }
}

#[async_trait]
impl Bucket for TestBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head(&self, key: &str) -> Result<BlobObject, Error> {
        let inner = self.inner.lock().unwrap();
        inner
            .objects
            .get(key)
            .map(|s| Self::object_of(key, s))
            .ok_or_else(|| Error::not_exist("blob head", format!("{}/{key}", self.name)))
    }

    async fn get(&self, key: &str) -> Result<(BlobObject, Bytes), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_log.push(key.to_string());
        if inner.fail_key.as_deref() == Some(key) {
            return Err(Error::temporary("blob get", format!("{key}: injected failure")));
        }
        inner
            .objects
            .get(key)
            .map(|s| (Self::object_of(key, s), s.data.clone()))
            .ok_or_else(|| Error::not_exist("blob get", format!("{}/{key}", self.name)))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        inner.put_log.push(key.to_string());
        if inner.fail_key.as_deref() == Some(key) {
            return Err(Error::temporary("blob put", format!("{key}: injected failure")));
        }
        let etag = Digest::from_bytes(&data).hex_n(32).to_string();
        inner.objects.insert(
            key.to_string(),
            Stored {
                data,
                etag,
                last_modified: Utc::now(),
                sha256: None,
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobObject>, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, s)| Self::object_of(k, s))
            .collect())
    }
}

/// A [`BlobStore`] over a fixed set of test buckets.
#[derive(Default)]
pub struct TestStore {
    buckets: BTreeMap<String, Arc<TestBucket>>,
}

impl TestStore {
    pub fn with_bucket(bucket: Arc<TestBucket>) -> Arc<Self> {
        let mut buckets = BTreeMap::new();
        buckets.insert(bucket.name.clone(), bucket);
        Arc::new(TestStore { buckets })
    }
}

#[async_trait]
impl BlobStore for TestStore {
    async fn bucket(&self, name: &str) -> Result<Arc<dyn Bucket>, Error> {
        self.buckets
            .get(name)
            .map(|b| Arc::clone(b) as Arc<dyn Bucket>)
            .ok_or_else(|| Error::not_exist("blob store", format!("bucket {name:?}")))
    }
}
