//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::lock::{LockMode, Resource};
use crate::transaction::savepoint::SavepointStack;
use crate::types::{IsolationLevel, Key, TransactionId};
use ledgerdb_codec::Value;
use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Lifecycle state of a transaction.
///
/// `Active -> Committing -> Committed`, or `Active -> Aborted`. A failed
/// commit moves `Committing -> Aborted`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Reads and writes are allowed.
    Active,
    /// Commit is in progress; external aborts are rejected.
    Committing,
    /// Writes are durable and visible.
    Committed,
    /// Writes were discarded.
    Aborted,
}

impl TransactionState {
    /// Whether the state is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        })
    }
}

/// One write in a transaction's pending list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mutation {
    pub key: Key,
    /// Value visible to the transaction just before this write.
    pub before: Option<Value>,
    /// Value written; `None` for a delete.
    pub after: Option<Value>,
    /// First write of `key` in this transaction.
    pub first_touch: bool,
}

/// A lock mode the transaction was granted, in grant order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldLock {
    pub resource: Resource,
    pub mode: LockMode,
}

/// Mutable bookkeeping of one transaction.
#[derive(Debug)]
pub(crate) struct Transaction {
    pub state: TransactionState,
    pub mutations: Vec<Mutation>,
    pub locks: Vec<HeldLock>,
    pub savepoints: SavepointStack,
}

impl Transaction {
    fn new(id: TransactionId) -> Self {
        Self {
            state: TransactionState::Active,
            mutations: Vec::new(),
            locks: Vec::new(),
            savepoints: SavepointStack::new(id),
        }
    }

    pub fn has_written(&self, key: &Key) -> bool {
        self.mutations.iter().any(|m| &m.key == key)
    }

    /// Keys with surviving writes, each once, in first-write order.
    pub fn written_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = Vec::new();
        for m in &self.mutations {
            if !keys.contains(&m.key) {
                keys.push(m.key.clone());
            }
        }
        keys
    }

    pub fn resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = Vec::new();
        for lock in &self.locks {
            if !resources.contains(&lock.resource) {
                resources.push(lock.resource.clone());
            }
        }
        resources
    }

    pub fn holds(&self, resource: &Resource, mode: LockMode) -> bool {
        self.locks
            .iter()
            .any(|l| &l.resource == resource && (l.mode == mode || l.mode == LockMode::Exclusive))
    }
}

pub(crate) struct TxnShared {
    pub id: TransactionId,
    pub isolation: IsolationLevel,
    /// Set before an external abort wakes lock waiters.
    pub cancelled: AtomicBool,
    pub inner: Mutex<Transaction>,
}

/// Handle to a transaction.
///
/// Handles are cheap to clone; every clone refers to the same transaction,
/// so one thread can abort a transaction another thread is running.
#[derive(Clone)]
pub struct TransactionHandle {
    pub(crate) shared: Arc<TxnShared>,
}

impl TransactionHandle {
    pub(crate) fn new(id: TransactionId, isolation: IsolationLevel) -> Self {
        Self {
            shared: Arc::new(TxnShared {
                id,
                isolation,
                cancelled: AtomicBool::new(false),
                inner: Mutex::new(Transaction::new(id)),
            }),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    /// Returns the isolation level.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.shared.isolation
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.shared.inner.lock().state
    }

    /// Whether the transaction still accepts operations.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Number of pending writes.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.shared.inner.lock().mutations.len()
    }

    /// Names of the live savepoints, oldest first.
    #[must_use]
    pub fn savepoint_names(&self) -> Vec<String> {
        self.shared.inner.lock().savepoints.names()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Transaction> {
        self.shared.inner.lock()
    }

    /// Locks the bookkeeping, failing unless the transaction is active.
    pub(crate) fn lock_active(&self) -> CoreResult<MutexGuard<'_, Transaction>> {
        let txn = self.lock();
        if txn.state != TransactionState::Active {
            return Err(CoreError::TransactionClosed {
                txid: self.id(),
                state: txn.state,
            });
        }
        Ok(txn)
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.shared.id)
            .field("isolation", &self.shared.isolation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TransactionState::Active.is_terminal());
        assert!(!TransactionState::Committing.is_terminal());
        assert!(TransactionState::Committed.is_terminal());
        assert!(TransactionState::Aborted.is_terminal());
    }

    #[test]
    fn clones_share_state() {
        let handle = TransactionHandle::new(TransactionId::new(1), IsolationLevel::Serializable);
        let other = handle.clone();
        handle.lock().state = TransactionState::Aborted;

        assert_eq!(other.state(), TransactionState::Aborted);
        assert!(matches!(
            other.lock_active(),
            Err(CoreError::TransactionClosed { .. })
        ));
    }

    #[test]
    fn written_keys_are_deduplicated_in_order() {
        let handle = TransactionHandle::new(TransactionId::new(1), IsolationLevel::ReadCommitted);
        let mut txn = handle.lock();
        for (k, first) in [("b", true), ("a", true), ("b", false)] {
            txn.mutations.push(Mutation {
                key: Key::from(k),
                before: None,
                after: Some(Value::Integer(1)),
                first_touch: first,
            });
        }
        assert_eq!(txn.written_keys(), vec![Key::from("b"), Key::from("a")]);
        assert!(txn.has_written(&Key::from("a")));
    }
}
