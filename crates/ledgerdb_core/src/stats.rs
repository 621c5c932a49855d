//! Database statistics and telemetry.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ledgerdb_core::Database;
//!
//! let db = Database::open_in_memory()?;
//! // ... run transactions ...
//! let stats = db.stats();
//! println!("commits: {}", stats.transactions_committed);
//! println!("deadlocks: {}", stats.deadlocks);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics and metrics.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    // Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,

    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,

    // Contention counters
    lock_waits: AtomicU64,
    lock_timeouts: AtomicU64,
    deadlocks: AtomicU64,

    constraint_violations: AtomicU64,
    savepoint_rollbacks: AtomicU64,
    durability_failures: AtomicU64,
    checkpoints: AtomicU64,
    wal_bytes: AtomicU64,
}

macro_rules! counter {
    ($record:ident, $get:ident) => {
        pub(crate) fn $record(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }

        #[doc = concat!("Returns the `", stringify!($get), "` counter.")]
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }
    };
}

impl DatabaseStats {
    /// Creates a new stats instance with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    counter!(record_read, reads);
    counter!(record_write, writes);
    counter!(record_delete, deletes);
    counter!(record_scan, scans);
    counter!(record_transaction_start, transactions_started);
    counter!(record_transaction_commit, transactions_committed);
    counter!(record_transaction_abort, transactions_aborted);
    counter!(record_lock_wait, lock_waits);
    counter!(record_lock_timeout, lock_timeouts);
    counter!(record_deadlock, deadlocks);
    counter!(record_constraint_violation, constraint_violations);
    counter!(record_savepoint_rollback, savepoint_rollbacks);
    counter!(record_durability_failure, durability_failures);
    counter!(record_checkpoint, checkpoints);

    pub(crate) fn record_wal_bytes(&self, bytes: u64) {
        self.wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns total bytes appended to the WAL.
    pub fn wal_bytes(&self) -> u64 {
        self.wal_bytes.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            deletes: self.deletes(),
            scans: self.scans(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            lock_waits: self.lock_waits(),
            lock_timeouts: self.lock_timeouts(),
            deadlocks: self.deadlocks(),
            constraint_violations: self.constraint_violations(),
            savepoint_rollbacks: self.savepoint_rollbacks(),
            durability_failures: self.durability_failures(),
            checkpoints: self.checkpoints(),
            wal_bytes: self.wal_bytes(),
        }
    }
}

/// A point-in-time snapshot of database statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Read operations.
    pub reads: u64,
    /// Write operations.
    pub writes: u64,
    /// Delete operations.
    pub deletes: u64,
    /// Key scans.
    pub scans: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted, for any reason.
    pub transactions_aborted: u64,
    /// Lock requests that had to wait.
    pub lock_waits: u64,
    /// Lock waits that timed out.
    pub lock_timeouts: u64,
    /// Deadlock victims.
    pub deadlocks: u64,
    /// Writes rejected by constraints.
    pub constraint_violations: u64,
    /// Savepoint rollbacks.
    pub savepoint_rollbacks: u64,
    /// Commits that failed to become durable.
    pub durability_failures: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
    /// Bytes appended to the WAL.
    pub wal_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = DatabaseStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_transactions() {
        let stats = DatabaseStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();
        stats.record_deadlock();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
        assert_eq!(snap.deadlocks, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(DatabaseStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_read();
                        s.record_wal_bytes(2);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.reads(), 800);
        assert_eq!(stats.wal_bytes(), 1600);
    }
}
