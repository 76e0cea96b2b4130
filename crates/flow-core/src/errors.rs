//! Error kinds shared across the workspace.
//!
//! Retrying subsystems (the launch driver, the transfer executor)
//! dispatch on [`ErrorKind`] rather than on concrete error types:
//! `Fatal` and `Unavailable` abort immediately, everything else
//! consumes a retry budget.

use serde::{Deserialize, Serialize};

/// Classification of an operational error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure; retry after backoff.
    Temporary,
    /// A deadline elapsed; treated like [`ErrorKind::Temporary`].
    Timeout,
    /// Capacity or type unavailability; the caller should pick a
    /// different instance type rather than retry the same one.
    Unavailable,
    /// Structural misconfiguration; retrying cannot help.
    Fatal,
    /// A row, bucket or key does not exist.
    NotExist,
    /// Connection-level network failure; retryable.
    Net,
    /// Unclassified; consumes a retry budget like `Temporary`.
    Other,
}

impl ErrorKind {
    /// Whether an error of this kind should consume a retry rather
    /// than abort.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Temporary | ErrorKind::Timeout | ErrorKind::Net | ErrorKind::Other
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Temporary => "temporary",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Fatal => "fatal",
            ErrorKind::NotExist => "not exist",
            ErrorKind::Net => "net",
            ErrorKind::Other => "error",
        }
    }
}

/// An operational error: a kind, the operation that failed, and a
/// message. Errors always carry the operation name so operational
/// triage is direct.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op}: {msg}")]
pub struct Error {
    pub kind: ErrorKind,
    pub op: String,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error {
            kind,
            op: op.into(),
            msg: msg.into(),
        }
    }

    pub fn temporary(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Temporary, op, msg)
    }

    pub fn timeout(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Timeout, op, msg)
    }

    pub fn unavailable(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Unavailable, op, msg)
    }

    pub fn fatal(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Fatal, op, msg)
    }

    pub fn not_exist(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::NotExist, op, msg)
    }

    pub fn net(op: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::new(ErrorKind::Net, op, msg)
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Rebuild the error with a different operation name, keeping kind
    /// and message.
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = op.into();
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Temporary.retryable());
        assert!(ErrorKind::Timeout.retryable());
        assert!(ErrorKind::Net.retryable());
        assert!(ErrorKind::Other.retryable());
        assert!(!ErrorKind::Fatal.retryable());
        assert!(!ErrorKind::Unavailable.retryable());
        assert!(!ErrorKind::NotExist.retryable());
    }

    #[test]
    fn display_carries_op() {
        let e = Error::temporary("describing instance (dns)", "no public DNS name");
        assert_eq!(
            e.to_string(),
            "describing instance (dns): no public DNS name"
        );
    }

    #[test]
    fn with_op_rewrites_only_op() {
        let e = Error::net("get", "connection refused").with_op("waiting for worker");
        assert_eq!(e.kind, ErrorKind::Net);
        assert_eq!(e.op, "waiting for worker");
        assert_eq!(e.msg, "connection refused");
    }
}
