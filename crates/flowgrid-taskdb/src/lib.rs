//! flowgrid-taskdb — the durable run/task metadata store.
//!
//! Every run and task is one row in a single wide table, keyed by its
//! full content digest. Rows carry labels, user, keepalive and start
//! times; task rows additionally reference the run that spawned them,
//! the flow node, the exec URI and the result/stdout/stderr/inspect
//! digests. Day-granularity date buckets are stored alongside the
//! keepalive so recently-active rows can be found without scanning
//! the whole table.
//!
//! Secondary indices:
//! 1. date-keepalive — time-bucketed queries over sparse days
//! 2. run-id — all tasks belonging to a run
//! 3. id4 — four-hex-digit identifier abbreviations
//!
//! The store is backed by redb; index tables are created by
//! `flowd migrate`, and a query against a database missing one fails
//! with an error pointing there.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::TaskDbError;
pub use store::TaskStore;
pub use types::{Query, Run, Task};
