//! Error types for LedgerDB core.

use crate::transaction::TransactionState;
use crate::types::{Key, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in LedgerDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] ledgerdb_storage::StorageError),

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] ledgerdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The key has no committed (or own staged) value.
    #[error("key not found: {key} ({txid})")]
    NotFound {
        /// The key that was read.
        key: Key,
        /// The reading transaction.
        txid: TransactionId,
    },

    /// A write was rejected by a registered constraint.
    ///
    /// The transaction stays active; the write never enters its pending list.
    #[error("constraint '{rule}' violated on {key} ({txid}): {reason}")]
    ConstraintViolation {
        /// The key being written.
        key: Key,
        /// The writing transaction.
        txid: TransactionId,
        /// Name of the failed rule.
        rule: String,
        /// Rule-supplied reason.
        reason: String,
    },

    /// A lock could not be granted immediately and no wait was allowed.
    ///
    /// The transaction stays active.
    #[error("lock on {resource} would block ({txid})")]
    WouldBlock {
        /// The contested resource.
        resource: String,
        /// The requesting transaction.
        txid: TransactionId,
    },

    /// A lock wait exceeded the configured timeout. The transaction was aborted.
    #[error("lock wait timeout on {resource} after {waited_ms} ms ({txid})")]
    LockTimeout {
        /// The contested resource.
        resource: String,
        /// The requesting transaction.
        txid: TransactionId,
        /// How long the request waited.
        waited_ms: u64,
    },

    /// The transaction was chosen as a deadlock victim and was aborted.
    #[error("deadlock detected; {txid} aborted as victim")]
    Deadlock {
        /// The victim.
        txid: TransactionId,
    },

    /// The transaction is no longer active.
    #[error("{txid} is closed ({state})")]
    TransactionClosed {
        /// The transaction.
        txid: TransactionId,
        /// Its current state.
        state: TransactionState,
    },

    /// The commit entry could not be made durable. The transaction was aborted.
    #[error("commit of {txid} not durable: {reason}")]
    DurabilityFailure {
        /// The transaction.
        txid: TransactionId,
        /// Underlying failure.
        reason: String,
    },

    /// Two transactions tried to stage the same key.
    #[error("write conflict on {key}: {txid} vs staged {holder}")]
    Conflict {
        /// The contested key.
        key: Key,
        /// The transaction that lost.
        txid: TransactionId,
        /// The transaction whose staged value is in place.
        holder: TransactionId,
    },

    /// A savepoint token does not name a live savepoint of this transaction.
    #[error("unknown savepoint '{name}' for {txid}")]
    UnknownSavepoint {
        /// The transaction.
        txid: TransactionId,
        /// The savepoint name carried by the token.
        name: String,
    },

    /// WAL is corrupted or invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Snapshot file is corrupted or invalid.
    #[error("snapshot corruption: {message}")]
    SnapshotCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// `recover` has not run yet.
    #[error("recovery has not been run; call recover() before beginning transactions")]
    RecoveryRequired,
}

impl CoreError {
    /// Creates a WAL corruption error.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Creates a snapshot corruption error.
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a durability failure error.
    pub fn durability_failure(txid: TransactionId, reason: impl ToString) -> Self {
        Self::DurabilityFailure {
            txid,
            reason: reason.to_string(),
        }
    }

    /// Whether the failed work may succeed if the transaction is retried
    /// from the start.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WouldBlock { .. } | Self::LockTimeout { .. } | Self::Deadlock { .. }
        )
    }

    /// Whether this error left the transaction aborted.
    #[must_use]
    pub fn aborts_transaction(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::Deadlock { .. }
                | Self::DurabilityFailure { .. }
                | Self::Conflict { .. }
        )
    }
}
