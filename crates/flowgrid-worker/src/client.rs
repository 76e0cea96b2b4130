//! The controller-side worker client.
//!
//! The launch driver talks to workers through [`WorkerApi`] so tests
//! can script worker behavior; [`HttpWorkerClient`] is the reqwest
//! implementation. Connection-level failures map to the `Net` error
//! kind, which retrying callers treat as temporary — a freshly
//! launched VM refuses connections until the worker is up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use flow_core::{Digest, Error, ErrorKind};

/// The worker operations the controller uses.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// `GET /v1/config`: the worker's configuration document.
    async fn config(&self) -> Result<Bytes, Error>;

    /// `GET /v1/execimage`: the installed image digest.
    async fn exec_image(&self) -> Result<Digest, Error>;

    /// `POST /v1/execimage`: ask the worker to replace itself with
    /// the image stored under `digest` in the shared repository.
    async fn install_image(&self, digest: &Digest) -> Result<(), Error>;
}

/// Connects [`WorkerApi`] clients to a worker by DNS name.
pub trait WorkerDialer: Send + Sync {
    fn dial(&self, dns: &str) -> Result<Arc<dyn WorkerApi>, Error>;
}

/// HTTP implementation of [`WorkerApi`].
pub struct HttpWorkerClient {
    base: String,
    http: reqwest::Client,
}

impl HttpWorkerClient {
    /// `base` is the versioned API root, e.g.
    /// `https://host:9000/v1/`.
    pub fn new(base: impl Into<String>, http: reqwest::Client) -> Self {
        HttpWorkerClient {
            base: base.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

fn request_err(op: &str, e: reqwest::Error) -> Error {
    let kind = if e.is_connect() {
        ErrorKind::Net
    } else if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_builder() {
        ErrorKind::Fatal
    } else {
        ErrorKind::Temporary
    };
    Error::new(kind, op, e.to_string())
}

fn status_err(op: &str, status: reqwest::StatusCode) -> Error {
    let kind = if status.is_server_error() {
        ErrorKind::Temporary
    } else {
        ErrorKind::Fatal
    };
    Error::new(kind, op, format!("unexpected status {status}"))
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn config(&self) -> Result<Bytes, Error> {
        const OP: &str = "worker config";
        let resp = self
            .http
            .get(self.url("config"))
            .send()
            .await
            .map_err(|e| request_err(OP, e))?;
        if !resp.status().is_success() {
            return Err(status_err(OP, resp.status()));
        }
        resp.bytes().await.map_err(|e| request_err(OP, e))
    }

    async fn exec_image(&self) -> Result<Digest, Error> {
        const OP: &str = "worker exec image";
        let resp = self
            .http
            .get(self.url("execimage"))
            .send()
            .await
            .map_err(|e| request_err(OP, e))?;
        if !resp.status().is_success() {
            return Err(status_err(OP, resp.status()));
        }
        let s: String = resp.json().await.map_err(|e| request_err(OP, e))?;
        Digest::parse(&s).map_err(|e| Error::fatal(OP, e.to_string()))
    }

    async fn install_image(&self, digest: &Digest) -> Result<(), Error> {
        const OP: &str = "worker install image";
        let resp = self
            .http
            .post(self.url("execimage"))
            .json(&digest.to_string())
            .send()
            .await
            .map_err(|e| request_err(OP, e))?;
        if !resp.status().is_success() {
            return Err(status_err(OP, resp.status()));
        }
        Ok(())
    }
}

/// Dials workers over HTTP(S) on a fixed port.
pub struct HttpDialer {
    /// Use cleartext HTTP instead of TLS.
    pub insecure: bool,
    pub port: u16,
    /// Per-request timeout applied by the underlying client.
    pub timeout: Duration,
}

impl Default for HttpDialer {
    fn default() -> Self {
        HttpDialer {
            insecure: false,
            port: crate::server::WORKER_PORT,
            timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerDialer for HttpDialer {
    fn dial(&self, dns: &str) -> Result<Arc<dyn WorkerApi>, Error> {
        let scheme = if self.insecure { "http" } else { "https" };
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::fatal("worker dial", e.to_string()))?;
        Ok(Arc::new(HttpWorkerClient::new(
            format!("{scheme}://{dns}:{}/v1/", self.port),
            http,
        )))
    }
}
