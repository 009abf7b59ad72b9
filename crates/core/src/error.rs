//! Error types for stratalog
//!
//! This module defines the error taxonomy shared by every layer.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! No layer retries I/O on its own: every error is reported to the caller,
//! who owns the retry policy.

use crate::lsn::Lsn;
use crate::types::TxnId;
use std::io;
use thiserror::Error;

/// Result type alias for stratalog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for stratalog
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on append, flush or read
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Length or checksum validation failed for the record at `lsn`
    #[error("Corrupt record at {lsn}: {reason}")]
    CorruptRecord {
        /// Position of the damaged record
        lsn: Lsn,
        /// What failed to validate
        reason: String,
    },

    /// No record satisfies the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transaction is not in the state the operation requires
    #[error("Transaction {txn_id} is {actual}, expected {expected}")]
    InvalidTransactionState {
        /// Transaction the operation targeted
        txn_id: TxnId,
        /// State(s) the operation accepts
        expected: String,
        /// State the transaction is actually in
        actual: String,
    },

    /// Operation on a closed handle or torn-down component
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Startup recovery could not complete
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Invalid argument supplied by the caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration file could not be read, parsed or validated
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A replicated record could not be applied
    #[error("Replication failed: {0}")]
    ReplicationFailed(String),
}

impl Error {
    /// Build a `CorruptRecord` error.
    pub fn corrupt(lsn: Lsn, reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            lsn,
            reason: reason.into(),
        }
    }

    /// Build a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    /// Build an `InvalidState` error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Build a `RecoveryFailed` error.
    pub fn recovery_failed(msg: impl Into<String>) -> Self {
        Error::RecoveryFailed(msg.into())
    }

    /// Build an `InvalidTransactionState` error.
    pub fn txn_state(txn_id: TxnId, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::InvalidTransactionState {
            txn_id,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// True for `CorruptRecord`.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::CorruptRecord { .. })
    }
}
