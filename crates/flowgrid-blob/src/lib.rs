//! flowgrid-blob — object-store ingress/egress for the worker.
//!
//! The transfer executor moves content between a blob store
//! (bucket + key addressing) and the local content-addressed
//! repository:
//!
//! - **intern** (blob → repo): list or probe the configured URL,
//!   skip keys whose content digest the repository already holds,
//!   stream the rest through a staging repository, and promote the
//!   staged objects in one batch on success.
//! - **extern** (repo → blob): write each fileset entry to its
//!   destination key.
//!
//! Transfer rates are aggregated into a process-wide counter; every
//! exporter's running total sums exactly to the published value.

pub mod filerepo;
pub mod rate;
pub mod store;
pub mod testing;
pub mod transfer;

pub use filerepo::FileRepository;
pub use rate::{transferred_bytes, RateExporter};
pub use store::{BlobObject, BlobStore, Bucket, Mux};
pub use transfer::{BlobExec, TransferConfig, TransferKind};
