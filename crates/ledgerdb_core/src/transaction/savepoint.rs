//! Savepoints: named marks inside a transaction that can be rolled back to.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;

/// Opaque reference to a savepoint, returned by `savepoint`.
///
/// A token only works on the transaction that created it, and only while
/// its mark is live.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SavepointToken {
    txid: TransactionId,
    id: u64,
    name: String,
}

impl SavepointToken {
    /// Name the savepoint was created with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transaction the savepoint belongs to.
    #[must_use]
    pub fn txid(&self) -> TransactionId {
        self.txid
    }
}

/// Positions recorded when a savepoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SavepointMark {
    pub mutation_len: usize,
    pub lock_len: usize,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    name: String,
    mark: SavepointMark,
}

/// Stack of live savepoints; later marks sit above earlier ones.
#[derive(Debug)]
pub(crate) struct SavepointStack {
    txid: TransactionId,
    next_id: u64,
    entries: Vec<Entry>,
}

impl SavepointStack {
    pub fn new(txid: TransactionId) -> Self {
        Self {
            txid,
            next_id: 1,
            entries: Vec::new(),
        }
    }

    /// Pushes a mark. Names need not be unique; tokens tell them apart.
    pub fn mark(&mut self, name: impl Into<String>, mark: SavepointMark) -> SavepointToken {
        let id = self.next_id;
        self.next_id += 1;
        let name = name.into();
        self.entries.push(Entry {
            id,
            name: name.clone(),
            mark,
        });
        SavepointToken {
            txid: self.txid,
            id,
            name,
        }
    }

    fn position(&self, token: &SavepointToken) -> CoreResult<usize> {
        let found = (token.txid == self.txid)
            .then(|| self.entries.iter().position(|e| e.id == token.id))
            .flatten();
        found.ok_or_else(|| CoreError::UnknownSavepoint {
            txid: self.txid,
            name: token.name.clone(),
        })
    }

    /// Drops every mark above `token`, keeping `token` itself, and returns
    /// its recorded positions.
    pub fn rollback_to(&mut self, token: &SavepointToken) -> CoreResult<SavepointMark> {
        let index = self.position(token)?;
        self.entries.truncate(index + 1);
        Ok(self.entries[index].mark)
    }

    /// Drops `token` and every mark above it. Pending writes are untouched.
    pub fn release(&mut self, token: &SavepointToken) -> CoreResult<()> {
        let index = self.position(token)?;
        self.entries.truncate(index);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
