//! Core type definitions for LedgerDB.

use std::borrow::Borrow;
use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused, so a
/// larger ID always means a more recently started transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Log sequence number.
///
/// Every log entry gets one; commit entries' sequence numbers give the
/// global total order of commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(seq: u64) -> Self {
        Self(seq)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// Primary key of a record.
///
/// Keys are plain strings. By convention a class prefix separated by `:`
/// (`"account:A"`) groups records for constraint registration and scans.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// Creates a key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the class prefix (text before the first `:`), if any.
    #[must_use]
    pub fn class(&self) -> Option<&str> {
        self.0.split_once(':').map(|(class, _)| class)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Key> for Key {
    fn from(k: &Key) -> Self {
        k.clone()
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// How strictly a transaction is isolated from concurrent work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum IsolationLevel {
    /// Reads take no lock and may observe uncommitted values.
    ReadUncommitted,
    /// Reads take a shared lock for the duration of the read only.
    ReadCommitted,
    /// Reads take a shared lock held until the transaction ends.
    #[default]
    RepeatableRead,
    /// Repeatable reads plus a store-wide predicate lock that blocks
    /// concurrent writers.
    Serializable,
}

impl IsolationLevel {
    /// Whether reads may observe other transactions' staged values.
    #[must_use]
    pub const fn allows_dirty_reads(self) -> bool {
        matches!(self, Self::ReadUncommitted)
    }

    /// Whether reads take a shared key lock at all.
    #[must_use]
    pub const fn locks_reads(self) -> bool {
        !matches!(self, Self::ReadUncommitted)
    }

    /// Whether shared key locks are held until the transaction ends.
    #[must_use]
    pub const fn holds_read_locks(self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Serializable)
    }

    /// Whether reads also lock the store-wide predicate resource.
    #[must_use]
    pub const fn locks_predicate(self) -> bool {
        matches!(self, Self::Serializable)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        })
    }
}
