//! flowgrid-worker — the long-running agent installed on each
//! launched VM, plus the client the controller uses to reach it.
//!
//! The worker serves a small HTTP/2 API on port 9000:
//!
//! - `GET /v1/config` — the worker's YAML configuration
//! - `GET /v1/execimage` — the installed image digest
//! - `POST /v1/execimage` — self-replacement: refuse unless idle,
//!   fetch the posted digest from the shared repository, install it
//!   and restart into the new image
//! - `GET /` — pool status
//!
//! In cluster mode the worker tags its own instance with
//! `worker:version` and `worker:digest` during bring-up, and shuts
//! itself down after ten idle minutes so unused instances never
//! outlive their work.

pub mod client;
pub mod pool;
pub mod server;

pub use client::{HttpDialer, HttpWorkerClient, WorkerApi, WorkerDialer};
pub use pool::{ExecGuard, Pool};
pub use server::{
    set_tags, ServerConfig, WorkerServer, DIGEST_TAG, MAX_CONCURRENT_STREAMS, VERSION_TAG,
    WORKER_PORT,
};
