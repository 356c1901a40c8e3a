//! Error types for the vialdb entity store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the entity store
///
/// Conflicts and transaction-state errors are returned synchronously to the
/// caller of the offending operation; commit-pipeline failures propagate
/// through the awaited commit handle. `NotFound` indicates an index
/// consistency violation and is never a user error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// A write would violate a unique index's key uniqueness
    ///
    /// Carries the offending index's diagnostic key string (prefixed with
    /// the table name when raised at commit time). Not retried
    /// automatically: the caller must retry the whole transaction or abort.
    #[error("duplicated key: {key}")]
    DuplicatedKey {
        /// Diagnostic key of the conflicting entry
        key: String,
    },

    /// An expected index chain entry is missing
    ///
    /// Raised by index-internal removal and chain-repair code. This is a
    /// structural bug rather than a user error.
    #[error("index entry not found: {key}")]
    NotFound {
        /// Diagnostic key of the missing entry
        key: String,
    },

    /// Operation invoked on a transaction that already committed
    #[error("transaction {id} is already committed")]
    TransactionCommitted {
        /// Transaction id
        id: u64,
    },

    /// Operation invoked on a transaction that was rolled back
    #[error("transaction {id} is rolled back")]
    TransactionRolledBack {
        /// Transaction id
        id: u64,
    },

    /// No table registered under the given name
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Requested table name
        name: String,
    },

    /// A table with the given name is already registered
    #[error("table {name} exists")]
    TableExists {
        /// Conflicting table name
        name: String,
    },

    /// A queued commit failed while being applied
    #[error("failed to commit transaction {id}")]
    CommitFailed {
        /// Transaction id
        id: u64,
        /// The error raised by the table commit
        #[source]
        source: Box<Error>,
    },

    /// The commit request was cancelled before it was applied
    #[error("commit was cancelled")]
    CommitCancelled,
}

impl Error {
    /// The underlying conflict key, if this error is (or wraps) a conflict
    pub fn conflict_key(&self) -> Option<&str> {
        match self {
            Error::DuplicatedKey { key } => Some(key),
            Error::CommitFailed { source, .. } => source.conflict_key(),
            _ => None,
        }
    }
}
