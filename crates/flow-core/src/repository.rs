//! The content-addressed repository seam.
//!
//! A repository stores blobs keyed by their own content digest. The
//! file-backed implementation lives in `flowgrid-blob`; this trait is
//! what the launch driver, the transfer executor and the worker
//! depend on.

use async_trait::async_trait;
use bytes::Bytes;

use crate::digest::Digest;
use crate::errors::Error;

#[async_trait]
pub trait Repository: Send + Sync {
    /// Whether the repository holds the given digest.
    async fn contains(&self, id: &Digest) -> Result<bool, Error>;

    /// Fetch the bytes for the given digest. Returns a `NotExist`
    /// error when absent.
    async fn get(&self, id: &Digest) -> Result<Bytes, Error>;

    /// Store the given bytes, returning their digest.
    async fn put(&self, data: Bytes) -> Result<Digest, Error>;
}
