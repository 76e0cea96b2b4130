//! Task store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskDbError {
    #[error("open task store: {0}")]
    Open(String),

    #[error("task store transaction: {0}")]
    Transaction(String),

    #[error("task store table: {0}")]
    Table(String),

    #[error("task store read: {0}")]
    Read(String),

    #[error("task store write: {0}")]
    Write(String),

    #[error("serialize row: {0}")]
    Serialize(String),

    #[error("deserialize row: {0}")]
    Deserialize(String),

    #[error("row not found: {0}")]
    NotFound(String),

    /// A query needed an index table this database does not have.
    #[error("index {index} missing: run `flowd migrate`")]
    IndexMissing { index: String },

    #[error("malformed rows: {0}")]
    Malformed(String),
}

pub type TaskDbResult<T> = Result<T, TaskDbError>;
