//! Error types for the ledger
//!
//! Every kind carries a stable numeric code that is part of the wire
//! contract with accountants.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
///
/// `Clone` because a single commit outcome is delivered to every waiter of
/// a posting group.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Empty batch or schema-invalid posting
    #[error("Posting(s) cannot be decoded: {0}")]
    Argument(String),

    /// Batch mixes postings with different uids
    #[error("Batch postings must have the same UID.")]
    UidMismatch,

    /// Username could not be resolved
    #[error("Unknown user: {0}")]
    UnknownUser(String),

    /// Contract ticker could not be resolved
    #[error("Unknown contract: {0}")]
    UnknownContract(String),

    /// Credits do not equal debits
    #[error("Posting quantities do not balance.")]
    QuantityMismatch,

    /// Postings disagree on transaction type
    #[error("Posting types do not match.")]
    TypeMismatch,

    /// Postings disagree on declared count
    #[error("Posting count is inconsistent.")]
    CountMismatch,

    /// Group never became complete before its deadline
    #[error("Timeout exceeded waiting for postings.")]
    GroupTimeout,

    /// Engine invoked with invalid internal state
    #[error("Invalid arguments supplied to commit: {0}")]
    Internal(String),

    /// Persistence layer failed; detail is logged, never returned
    #[error("Database error.")]
    Database,
}

impl Error {
    /// Stable numeric code
    pub fn code(&self) -> u16 {
        match self {
            Error::Argument(_) => 100,
            Error::UidMismatch => 101,
            Error::UnknownUser(_) => 102,
            Error::UnknownContract(_) => 103,
            Error::QuantityMismatch => 200,
            Error::TypeMismatch => 201,
            Error::CountMismatch => 202,
            Error::GroupTimeout => 300,
            Error::Internal(_) => 998,
            Error::Database => 999,
        }
    }

    /// Kind name used in replies and metric labels
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_) => ErrorKind::ArgumentError,
            Error::UidMismatch => ErrorKind::UidMismatch,
            Error::UnknownUser(_) => ErrorKind::UnknownUser,
            Error::UnknownContract(_) => ErrorKind::UnknownContract,
            Error::QuantityMismatch => ErrorKind::QuantityMismatch,
            Error::TypeMismatch => ErrorKind::TypeMismatch,
            Error::CountMismatch => ErrorKind::CountMismatch,
            Error::GroupTimeout => ErrorKind::GroupTimeout,
            Error::Internal(_) => ErrorKind::InternalError,
            Error::Database => ErrorKind::DatabaseError,
        }
    }

    /// Whether a caller may resubmit the same transaction under a fresh uid
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Database | Error::GroupTimeout)
    }
}

/// Caller-visible error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// See [`Error::Argument`]
    ArgumentError,
    /// See [`Error::UidMismatch`]
    UidMismatch,
    /// See [`Error::UnknownUser`]
    UnknownUser,
    /// See [`Error::UnknownContract`]
    UnknownContract,
    /// See [`Error::QuantityMismatch`]
    QuantityMismatch,
    /// See [`Error::TypeMismatch`]
    TypeMismatch,
    /// See [`Error::CountMismatch`]
    CountMismatch,
    /// See [`Error::GroupTimeout`]
    GroupTimeout,
    /// See [`Error::Internal`]
    InternalError,
    /// See [`Error::Database`]
    DatabaseError,
}

impl ErrorKind {
    /// Name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ArgumentError => "ArgumentError",
            ErrorKind::UidMismatch => "UidMismatch",
            ErrorKind::UnknownUser => "UnknownUser",
            ErrorKind::UnknownContract => "UnknownContract",
            ErrorKind::QuantityMismatch => "QuantityMismatch",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::CountMismatch => "CountMismatch",
            ErrorKind::GroupTimeout => "GroupTimeout",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::DatabaseError => "DatabaseError",
        }
    }
}

/// Result type for the persistence boundary
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a [`crate::storage::Store`]
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transient/operational failure (I/O, RocksDB, unreachable backend)
    #[error("Storage error: {0}")]
    Operational(String),

    /// No such user
    #[error("User not found: {0}")]
    UnknownUser(String),

    /// No such contract
    #[error("Contract not found: {0}")]
    UnknownContract(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Operational(err.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Operational(err.to_string())
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownUser(name) => Error::UnknownUser(name),
            StoreError::UnknownContract(ticker) => Error::UnknownContract(ticker),
            StoreError::Operational(_) | StoreError::Serialization(_) => Error::Database,
        }
    }
}
