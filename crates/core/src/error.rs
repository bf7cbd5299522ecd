//! Error types for docrestore
//!
//! One taxonomy is shared by every restore stage. Discovery errors abort only
//! the affected branch, stream-framing errors abort the whole restore, and
//! apply errors are surfaced per namespace.

use std::io;
use thiserror::Error;

/// Result type alias for restore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for a restore run
#[derive(Debug, Error)]
pub enum Error {
    /// Bad namespace name or unreadable dump entry; only that subtree is skipped
    #[error("Discovery error at {location}: {reason}")]
    Discovery {
        /// Path or namespace being discovered
        location: String,
        /// What went wrong
        reason: String,
    },

    /// Two sources map to the same destination namespace
    #[error("Duplicate namespace: {0}")]
    DuplicateNamespace(String),

    /// The archive stream is malformed at the current cursor position
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// A chunk was addressed to a namespace nobody registered for
    #[error("Unexpected namespace in archive: {0}")]
    UnexpectedNamespace(String),

    /// Transaction buffers were still open when the oplog ended
    #[error("{transactions} transaction(s) never committed or aborted ({operations} operation(s) unapplied)")]
    TransactionIncomplete {
        /// Number of unterminated transactions
        transactions: usize,
        /// Buffered operations that were never applied
        operations: usize,
    },

    /// The destination rejected an operation for one namespace
    #[error("Failed to apply to {namespace}: {reason}")]
    Apply {
        /// Destination namespace
        namespace: String,
        /// Reason reported by the destination
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The restore was cancelled
    #[error("Restore cancelled")]
    Cancelled,
}

impl Error {
    /// Create a discovery error
    pub fn discovery(location: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Discovery {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt archive error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptArchive(msg.into())
    }

    /// Create an apply error
    pub fn apply(namespace: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Apply {
            namespace: namespace.into(),
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Error::Serialization(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Error::InvalidOperation(msg.into())
    }

    /// Whether this error aborts the whole restore
    ///
    /// Discovery, apply and incomplete-transaction errors are reported and
    /// the restore continues with sibling namespaces.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::Discovery { .. } | Error::Apply { .. } | Error::TransactionIncomplete { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
