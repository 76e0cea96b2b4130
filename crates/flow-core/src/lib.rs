//! flow-core — shared domain types for the flowgrid workspace.
//!
//! Everything here is consumed by at least two sibling crates:
//!
//! - [`Digest`] — SHA-256 content identifiers with abbreviation support
//! - [`Resources`] — resource vectors with availability comparison
//! - [`Fileset`] / [`File`] / [`Assertions`] — transferred-content records
//! - [`Error`] / [`ErrorKind`] — the error kinds the retry machinery
//!   dispatches on
//! - [`OnceTask`] — do-exactly-once with a memoized, broadcast result
//! - [`Repository`] — the content-addressed byte store seam

pub mod digest;
pub mod errors;
pub mod fileset;
pub mod once;
pub mod repository;
pub mod resources;

pub use digest::Digest;
pub use errors::{Error, ErrorKind, Result};
pub use fileset::{Assertions, File, Fileset};
pub use once::OnceTask;
pub use repository::Repository;
pub use resources::Resources;

use std::collections::BTreeMap;

/// String labels attached to runs, tasks and instances.
///
/// Persisted with `key=value` encoding.
pub type Labels = BTreeMap<String, String>;
