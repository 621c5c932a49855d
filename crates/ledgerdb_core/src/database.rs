//! Database facade.
//!
//! [`Database`] ties the transaction manager to its storage: a WAL backend
//! and a snapshot backend, taken from a directory or supplied directly.

use crate::config::Config;
use crate::constraint::{ConstraintEngine, RecordClass};
#[cfg(feature = "std")]
use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use crate::recovery::RecoveryReport;
use crate::snapshot::SnapshotStore;
use crate::stats::{DatabaseStats, StatsSnapshot};
use crate::transaction::{CheckpointReport, SavepointToken, TransactionHandle, TransactionManager};
use crate::types::{IsolationLevel, Key, SequenceNumber};
use crate::wal::WalManager;
use ledgerdb_codec::Value;
use ledgerdb_storage::StorageBackend;
use parking_lot::RwLock;
#[cfg(feature = "std")]
use std::path::Path;
use std::sync::Arc;

/// The main database handle.
///
/// # Opening a Database
///
/// ```rust,ignore
/// use ledgerdb_core::{Database, IsolationLevel};
/// use std::path::Path;
///
/// let db = Database::open(Path::new("ledger"))?;
/// db.recover()?;
///
/// db.transaction(IsolationLevel::Serializable, |db, txn| {
///     db.write(txn, &"acct:A".into(), 1000.into())
/// })?;
/// ```
///
/// Opening does not replay anything: [`Database::recover`] must run once
/// before the first transaction, and `begin` fails with `RecoveryRequired`
/// until it has.
///
/// # In-Memory Databases
///
/// [`Database::open_in_memory`] returns a recovered database over fresh
/// in-memory backends. [`Database::open_with_backends`] accepts any pair of
/// backends; tests use shared `MemoryBackend` clones to restart a database
/// over the bytes a previous instance left behind.
pub struct Database {
    /// Configuration.
    config: Config,
    /// Database directory (holds the lock). None when opened over backends.
    #[cfg(feature = "std")]
    dir: Option<DatabaseDir>,
    /// Transaction manager.
    manager: TransactionManager,
    /// Shared counters.
    stats: Arc<DatabaseStats>,
    /// Whether the database is open.
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a database directory with the default configuration.
    ///
    /// # Errors
    ///
    /// - another process has the directory locked (`DatabaseLocked`)
    /// - I/O errors
    #[cfg(feature = "std")]
    pub fn open(path: &Path) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens a database directory with a custom configuration.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// use ledgerdb_core::{Config, Database};
    /// use std::time::Duration;
    ///
    /// let config = Config::default()
    ///     .lock_timeout(Duration::from_millis(200))
    ///     .sync_on_commit(true);
    ///
    /// let db = Database::open_with_config(Path::new("ledger"), config)?;
    /// ```
    #[cfg(feature = "std")]
    pub fn open_with_config(path: &Path, config: Config) -> CoreResult<Self> {
        use ledgerdb_storage::FileBackend;

        let dir = DatabaseDir::open(path, config.create_if_missing)?;
        let wal_backend = FileBackend::open_with_create_dirs(&dir.wal_path())?;
        let snapshot_backend = FileBackend::open_with_create_dirs(&dir.snapshot_path())?;

        let mut db = Self::open_with_backends(
            config,
            Box::new(wal_backend),
            Box::new(snapshot_backend),
        )?;
        tracing::info!(path = %dir.path().display(), "database opened");
        db.dir = Some(dir);
        Ok(db)
    }

    /// Opens a database over the given backends. Nothing is read until
    /// [`Database::recover`] runs.
    pub fn open_with_backends(
        config: Config,
        wal_backend: Box<dyn StorageBackend>,
        snapshot_backend: Box<dyn StorageBackend>,
    ) -> CoreResult<Self> {
        let stats = Arc::new(DatabaseStats::new());
        let wal = Arc::new(WalManager::new(
            wal_backend,
            config.sync_on_commit,
            config.wal_buffer_limit,
        ));
        let snapshots = Arc::new(SnapshotStore::new(snapshot_backend));
        let manager =
            TransactionManager::new(config.clone(), wal, snapshots, Arc::clone(&stats));

        Ok(Self {
            config,
            #[cfg(feature = "std")]
            dir: None,
            manager,
            stats,
            is_open: RwLock::new(true),
        })
    }

    /// Opens a fresh, already recovered in-memory database.
    ///
    /// Data is lost when the database is dropped.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Like [`Database::open_in_memory`], with a custom configuration.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        use ledgerdb_storage::MemoryBackend;
        let db = Self::open_with_backends(
            config,
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
        )?;
        db.recover()?;
        Ok(db)
    }

    /// Rebuilds committed state from the snapshot and the WAL.
    ///
    /// Must be called exactly once, before any transaction begins.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        self.ensure_open()?;
        self.manager.recover()
    }

    /// Whether [`Database::recover`] has run.
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        self.manager.is_recovered()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Begins a transaction.
    pub fn begin(&self, isolation: IsolationLevel) -> CoreResult<TransactionHandle> {
        self.ensure_open()?;
        self.manager.begin(isolation)
    }

    /// Reads `key`; fails with `NotFound` if it has no visible value.
    pub fn read(&self, txn: &TransactionHandle, key: &Key) -> CoreResult<Value> {
        self.ensure_open()?;
        self.manager.read(txn, key)
    }

    /// Reads `key`, returning `None` if it has no visible value.
    pub fn get(&self, txn: &TransactionHandle, key: &Key) -> CoreResult<Option<Value>> {
        self.ensure_open()?;
        self.manager.get(txn, key)
    }

    /// Writes `value` to `key` within the transaction.
    ///
    /// Registered constraints are checked first. A violation rejects the
    /// write and leaves the transaction active.
    pub fn write(&self, txn: &TransactionHandle, key: &Key, value: Value) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.write(txn, key, value)
    }

    /// Deletes `key` within the transaction.
    pub fn delete(&self, txn: &TransactionHandle, key: &Key) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.delete(txn, key)
    }

    /// Lists the keys in `class` visible to the transaction, in key order.
    pub fn scan_keys(&self, txn: &TransactionHandle, class: &RecordClass) -> CoreResult<Vec<Key>> {
        self.ensure_open()?;
        self.manager.scan_keys(txn, class)
    }

    /// Sets a savepoint.
    pub fn savepoint(
        &self,
        txn: &TransactionHandle,
        name: impl Into<String>,
    ) -> CoreResult<SavepointToken> {
        self.ensure_open()?;
        self.manager.savepoint(txn, name)
    }

    /// Undoes the transaction's writes made after `token`.
    pub fn rollback_to(&self, txn: &TransactionHandle, token: &SavepointToken) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.rollback_to_savepoint(txn, token)
    }

    /// Discards `token` and every later savepoint, keeping the writes.
    pub fn release_savepoint(
        &self,
        txn: &TransactionHandle,
        token: &SavepointToken,
    ) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.release_savepoint(txn, token)
    }

    /// Commits a transaction, returning its commit sequence number.
    pub fn commit(&self, txn: &TransactionHandle) -> CoreResult<SequenceNumber> {
        self.ensure_open()?;
        self.manager.commit(txn)
    }

    /// Aborts a transaction.
    pub fn abort(&self, txn: &TransactionHandle) -> CoreResult<()> {
        self.ensure_open()?;
        self.manager.abort(txn)
    }

    /// Executes a function within a transaction.
    ///
    /// If the function returns `Ok`, the transaction is committed.
    /// If it returns `Err`, the transaction is aborted (unless the error
    /// already ended it) and the error is returned.
    pub fn transaction<F, T>(&self, isolation: IsolationLevel, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Self, &TransactionHandle) -> CoreResult<T>,
    {
        let txn = self.begin(isolation)?;
        match f(self, &txn) {
            Ok(value) => {
                self.commit(&txn)?;
                Ok(value)
            }
            Err(err) => {
                if txn.is_active() {
                    self.manager.abort(&txn)?;
                }
                Err(err)
            }
        }
    }

    /// Like [`Database::transaction`], but reruns `f` in a new transaction
    /// when it fails with a retryable error (`WouldBlock`, `LockTimeout` or
    /// `Deadlock`), up to `attempts` runs in total.
    pub fn transaction_with_retry<F, T>(
        &self,
        isolation: IsolationLevel,
        attempts: usize,
        mut f: F,
    ) -> CoreResult<T>
    where
        F: FnMut(&Self, &TransactionHandle) -> CoreResult<T>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.transaction(isolation, &mut f) {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::debug!(attempt, error = %err, "retrying transaction");
                    attempt += 1;
                    std::thread::yield_now();
                }
                result => return result,
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Writes a snapshot of the committed state and truncates the WAL.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        self.ensure_open()?;
        self.manager.checkpoint()
    }

    /// The constraint registry. Rules registered here apply to every
    /// subsequent write.
    #[must_use]
    pub fn constraints(&self) -> &ConstraintEngine {
        self.manager.constraints()
    }

    /// Returns a copy of the database counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Highest durable commit sequence number.
    #[must_use]
    pub fn committed_lsn(&self) -> SequenceNumber {
        self.manager.committed_seq()
    }

    /// Number of transactions neither committed nor aborted.
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.manager.active_count()
    }

    /// Number of committed records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.manager.store().len()
    }

    /// Size of the WAL in bytes, including buffered entries.
    pub fn wal_size(&self) -> CoreResult<u64> {
        self.manager.wal().size()
    }

    /// Closes the database.
    ///
    /// Active transactions are aborted and buffered WAL entries flushed.
    /// Later calls on this handle fail with `DatabaseClosed`.
    pub fn close(&self) -> CoreResult<()> {
        let mut is_open = self.is_open.write();
        if !*is_open {
            return Ok(());
        }

        let aborted = self.manager.abort_all();
        if aborted > 0 {
            tracing::warn!(aborted, "aborted unfinished transactions on close");
        }
        self.manager.wal().flush()?;

        *is_open = false;
        tracing::info!(committed = %self.committed_lsn(), "database closed");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Ensures the database is open.
    fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// Returns database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the database directory, if opened from one.
    #[cfg(feature = "std")]
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(DatabaseDir::path)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("recovered", &self.is_recovered())
            .field("records", &self.record_count())
            .field("committed_lsn", &self.committed_lsn())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::NonNegative;
    use crate::lock::{LockMode, Resource};
    use crate::transaction::TransactionState;
    use ledgerdb_storage::{FaultPlan, FaultyBackend, MemoryBackend};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn key(k: &str) -> Key {
        Key::from(k)
    }

    fn create_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn no_wait() -> Config {
        Config::default().lock_timeout(Duration::ZERO)
    }

    /// Seeds `acct:A = 1000`, `acct:B = 500` and a non-negative rule on accounts.
    fn seed(db: &Database) {
        db.constraints()
            .register(RecordClass::prefix("acct"), NonNegative);
        db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.write(txn, &key("acct:A"), Value::Integer(1000))?;
            db.write(txn, &key("acct:B"), Value::Integer(500))
        })
        .unwrap();
    }

    fn committed(db: &Database, k: &str) -> Option<Value> {
        db.transaction(IsolationLevel::ReadCommitted, |db, txn| db.get(txn, &key(k)))
            .unwrap()
    }

    #[test]
    fn open_in_memory() {
        let db = create_db();
        assert!(db.is_open());
        assert!(db.is_recovered());
        assert_eq!(db.record_count(), 0);
    }

    #[test]
    fn begin_requires_recovery() {
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(MemoryBackend::new()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        assert!(matches!(
            db.begin(IsolationLevel::ReadCommitted),
            Err(CoreError::RecoveryRequired)
        ));
        db.recover().unwrap();
        assert!(db.begin(IsolationLevel::ReadCommitted).is_ok());
        assert!(matches!(
            db.recover(),
            Err(CoreError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn transfer_commits_atomically() {
        let db = create_db();
        seed(&db);

        let t1 = db.begin(IsolationLevel::Serializable).unwrap();
        let a = db.read(&t1, &key("acct:A")).unwrap().as_i64().unwrap();
        let b = db.read(&t1, &key("acct:B")).unwrap().as_i64().unwrap();
        db.write(&t1, &key("acct:A"), Value::Integer(a - 100)).unwrap();
        db.write(&t1, &key("acct:B"), Value::Integer(b + 100)).unwrap();
        db.commit(&t1).unwrap();

        assert_eq!(t1.state(), TransactionState::Committed);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(900)));
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(600)));
    }

    #[test]
    fn constraint_violation_keeps_transaction_active() {
        let db = create_db();
        seed(&db);

        let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = db.write(&t2, &key("acct:A"), Value::Integer(-50)).unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation { ref rule, .. } if rule == "non_negative"));
        assert!(t2.is_active());
        assert_eq!(t2.pending_writes(), 0);

        // The rejected write took no lock and left nothing behind.
        db.write(&t2, &key("acct:A"), Value::Integer(10)).unwrap();
        db.abort(&t2).unwrap();
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
        assert_eq!(db.stats().constraint_violations, 1);
    }

    #[test]
    fn savepoint_rollback_keeps_earlier_write() {
        let db = create_db();
        seed(&db);

        let t3 = db.begin(IsolationLevel::RepeatableRead).unwrap();
        db.write(&t3, &key("acct:A"), Value::Integer(800)).unwrap();
        let s1 = db.savepoint(&t3, "s1").unwrap();
        db.write(&t3, &key("acct:A"), Value::Integer(700)).unwrap();
        db.write(&t3, &key("acct:C"), Value::Integer(5)).unwrap();
        assert_eq!(db.read(&t3, &key("acct:A")).unwrap(), Value::Integer(700));

        db.rollback_to(&t3, &s1).unwrap();
        assert_eq!(db.read(&t3, &key("acct:A")).unwrap(), Value::Integer(800));
        assert_eq!(db.get(&t3, &key("acct:C")).unwrap(), None);
        assert!(t3.is_active());
        db.commit(&t3).unwrap();

        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(800)));
        assert_eq!(committed(&db, "acct:C"), None);
    }

    #[test]
    fn savepoint_rollback_releases_new_exclusive_locks() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let sp = db.savepoint(&t1, "before_b").unwrap();
        db.write(&t1, &key("acct:B"), Value::Integer(1)).unwrap();
        db.rollback_to(&t1, &sp).unwrap();

        let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&t2, &key("acct:B"), Value::Integer(2)).unwrap();
        db.commit(&t2).unwrap();
        db.commit(&t1).unwrap();
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(2)));
    }

    #[test]
    fn released_savepoint_cannot_be_rolled_back_to() {
        let db = create_db();
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let sp = db.savepoint(&txn, "s").unwrap();
        db.write(&txn, &key("k"), Value::Integer(1)).unwrap();
        db.release_savepoint(&txn, &sp).unwrap();
        assert!(matches!(
            db.rollback_to(&txn, &sp),
            Err(CoreError::UnknownSavepoint { .. })
        ));
        assert_eq!(txn.pending_writes(), 1);
    }

    #[test]
    fn deadlock_aborts_exactly_one_transaction() {
        let config = Config::default().lock_timeout(Duration::from_secs(10));
        let db = Arc::new(Database::open_in_memory_with_config(config).unwrap());
        seed(&db);

        let t4 = db.begin(IsolationLevel::Serializable).unwrap();
        let t5 = db.begin(IsolationLevel::Serializable).unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let run = |txn: TransactionHandle, first: &'static str, second: &'static str| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                db.write(&txn, &key(first), Value::Integer(1))?;
                barrier.wait();
                db.write(&txn, &key(second), Value::Integer(2))?;
                db.commit(&txn)
            })
        };

        let h4 = run(t4.clone(), "acct:A", "acct:B");
        let h5 = run(t5.clone(), "acct:B", "acct:A");
        let r4 = h4.join().unwrap();
        let r5 = h5.join().unwrap();

        // The newest transaction in the cycle is the victim.
        assert!(r4.is_ok());
        assert!(matches!(r5, Err(CoreError::Deadlock { txid }) if txid == t5.id()));
        assert_eq!(t5.state(), TransactionState::Aborted);
        assert_eq!(t4.state(), TransactionState::Committed);
        assert_eq!(db.stats().deadlocks, 1);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1)));
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(2)));
    }

    #[test]
    fn read_uncommitted_sees_dirty_writes() {
        let db = create_db();
        seed(&db);

        let writer = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&writer, &key("acct:A"), Value::Integer(1)).unwrap();

        let reader = db.begin(IsolationLevel::ReadUncommitted).unwrap();
        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(1));

        db.abort(&writer).unwrap();
        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(1000));
    }

    #[test]
    fn read_committed_never_sees_dirty_writes() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let writer = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&writer, &key("acct:A"), Value::Integer(1)).unwrap();

        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = db.read(&reader, &key("acct:A")).unwrap_err();
        assert!(matches!(err, CoreError::WouldBlock { .. }));
        assert!(reader.is_active());

        db.commit(&writer).unwrap();
        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(1));
    }

    #[test]
    fn read_committed_releases_read_locks() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let reader = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.read(&reader, &key("acct:A")).unwrap();

        let writer = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&writer, &key("acct:A"), Value::Integer(7)).unwrap();
        db.commit(&writer).unwrap();

        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(7));
    }

    #[test]
    fn repeatable_read_blocks_writers_of_read_keys() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let reader = db.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(1000));

        let writer = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = db.write(&writer, &key("acct:A"), Value::Integer(1)).unwrap_err();
        assert!(matches!(err, CoreError::WouldBlock { .. }));
        assert!(writer.is_active());

        assert_eq!(db.read(&reader, &key("acct:A")).unwrap(), Value::Integer(1000));
        db.commit(&reader).unwrap();
        db.write(&writer, &key("acct:A"), Value::Integer(1)).unwrap();
        db.commit(&writer).unwrap();
    }

    #[test]
    fn serializable_scan_blocks_phantoms() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let scanner = db.begin(IsolationLevel::Serializable).unwrap();
        let keys = db.scan_keys(&scanner, &RecordClass::prefix("acct")).unwrap();
        assert_eq!(keys, vec![key("acct:A"), key("acct:B")]);

        let inserter = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = db.write(&inserter, &key("acct:C"), Value::Integer(1)).unwrap_err();
        assert!(matches!(err, CoreError::WouldBlock { .. }));

        let again = db.scan_keys(&scanner, &RecordClass::prefix("acct")).unwrap();
        assert_eq!(again, keys);
        db.commit(&scanner).unwrap();
    }

    #[test]
    fn lock_timeout_aborts_waiter() {
        let config = Config::default().lock_timeout(Duration::from_millis(30));
        let db = Database::open_in_memory_with_config(config).unwrap();
        seed(&db);

        let holder = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&holder, &key("acct:A"), Value::Integer(1)).unwrap();

        let waiter = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&waiter, &key("acct:B"), Value::Integer(1)).unwrap();
        let err = db.write(&waiter, &key("acct:A"), Value::Integer(2)).unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        assert_eq!(waiter.state(), TransactionState::Aborted);
        assert!(matches!(
            db.commit(&waiter),
            Err(CoreError::TransactionClosed { .. })
        ));

        db.commit(&holder).unwrap();
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(500)));
    }

    #[test]
    fn abort_from_another_thread_ends_lock_wait() {
        let db = Arc::new(create_db());
        seed(&db);

        let holder = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&holder, &key("acct:A"), Value::Integer(1)).unwrap();

        let waiter = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let blocked = {
            let db = Arc::clone(&db);
            let waiter = waiter.clone();
            thread::spawn(move || db.write(&waiter, &key("acct:A"), Value::Integer(2)))
        };

        while db.manager.locks().waiting() == 0 {
            thread::yield_now();
        }
        db.abort(&waiter).unwrap();

        let err = blocked.join().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::TransactionClosed { .. }));
        assert_eq!(waiter.state(), TransactionState::Aborted);
        db.commit(&holder).unwrap();
    }

    #[test]
    fn closure_error_aborts_transaction() {
        let db = create_db();
        seed(&db);

        let result: CoreResult<()> = db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.write(txn, &key("acct:A"), Value::Integer(1))?;
            Err(CoreError::invalid_operation("changed my mind"))
        });
        assert!(result.is_err());
        assert_eq!(db.active_transactions(), 0);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
    }

    #[test]
    fn retry_reruns_after_would_block() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let holder = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&holder, &key("acct:A"), Value::Integer(1)).unwrap();

        let mut runs = 0;
        let result = db.transaction_with_retry(IsolationLevel::ReadCommitted, 3, |db, txn| {
            runs += 1;
            if runs == 2 {
                db.commit(&holder)?;
            }
            db.write(txn, &key("acct:A"), Value::Integer(2))
        });
        assert!(result.is_ok());
        assert_eq!(runs, 2);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(2)));
    }

    #[test]
    fn refused_write_releases_intent_lock() {
        let db = Database::open_in_memory_with_config(no_wait()).unwrap();
        seed(&db);

        let holder = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&holder, &key("acct:A"), Value::Integer(1)).unwrap();
        let refused = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let err = db.write(&refused, &key("acct:A"), Value::Integer(2)).unwrap_err();
        assert!(matches!(err, CoreError::WouldBlock { .. }));
        assert!(refused.is_active());
        db.commit(&holder).unwrap();

        // The refused writer staged nothing, so serializable readers proceed.
        let reader = db.begin(IsolationLevel::Serializable).unwrap();
        assert_eq!(
            db.get(&reader, &key("acct:B")).unwrap(),
            Some(Value::Integer(500))
        );
        db.commit(&reader).unwrap();
        db.abort(&refused).unwrap();
    }

    #[test]
    fn violation_after_lock_wait_releases_intent_lock() {
        let db = Arc::new(create_db());
        db.constraints()
            .register_fn(RecordClass::Exact(key("meter")), "monotonic", |old, new| {
                match (old.and_then(Value::as_i64), new.and_then(Value::as_i64)) {
                    (Some(old), Some(new)) if new < old => Err(format!("{new} < {old}")),
                    _ => Ok(()),
                }
            });
        db.transaction(IsolationLevel::ReadCommitted, |db, txn| {
            db.write(txn, &key("meter"), Value::Integer(100))
        })
        .unwrap();

        let t1 = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&t1, &key("meter"), Value::Integer(200)).unwrap();

        let t2 = db.begin(IsolationLevel::ReadCommitted).unwrap();
        let blocked = {
            let db = Arc::clone(&db);
            let t2 = t2.clone();
            // 150 passes against the committed 100, then fails against 200.
            thread::spawn(move || db.write(&t2, &key("meter"), Value::Integer(150)))
        };
        while db.manager.locks().waiting() == 0 {
            thread::yield_now();
        }
        db.commit(&t1).unwrap();

        let err = blocked.join().unwrap().unwrap_err();
        assert!(matches!(err, CoreError::ConstraintViolation { ref rule, .. } if rule == "monotonic"));
        assert!(t2.is_active());
        let locks = db.manager.locks();
        assert!(!locks.holds(t2.id(), &Resource::Predicate, LockMode::IntentExclusive));
        assert!(!locks.holds(t2.id(), &Resource::Key(key("meter")), LockMode::Exclusive));

        let reader = db.begin(IsolationLevel::Serializable).unwrap();
        assert_eq!(
            db.get(&reader, &key("meter")).unwrap(),
            Some(Value::Integer(200))
        );
        db.commit(&reader).unwrap();
        db.abort(&t2).unwrap();
    }

    #[test]
    fn delete_removes_record() {
        let db = create_db();
        seed(&db);
        db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.delete(txn, &key("acct:B"))
        })
        .unwrap();
        assert_eq!(committed(&db, "acct:B"), None);
        assert_eq!(db.record_count(), 1);
    }

    #[test]
    fn read_only_commit_logs_nothing() {
        let db = create_db();
        seed(&db);
        let before = db.wal_size().unwrap();
        let lsn = db.committed_lsn();

        let txn = db.begin(IsolationLevel::RepeatableRead).unwrap();
        db.read(&txn, &key("acct:A")).unwrap();
        assert_eq!(db.commit(&txn).unwrap(), lsn);
        assert_eq!(db.wal_size().unwrap(), before);
    }

    #[test]
    fn closed_database_rejects_operations() {
        let db = create_db();
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.close().unwrap();
        assert!(!db.is_open());
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(matches!(
            db.begin(IsolationLevel::ReadCommitted),
            Err(CoreError::DatabaseClosed)
        ));
        db.close().unwrap();
    }

    // ========================================================================
    // Restart and crash tests over shared memory backends
    // ========================================================================

    struct Disk {
        wal: MemoryBackend,
        snapshots: MemoryBackend,
    }

    impl Disk {
        fn new() -> Self {
            Self {
                wal: MemoryBackend::new(),
                snapshots: MemoryBackend::new(),
            }
        }

        fn open(&self) -> Database {
            let db = Database::open_with_backends(
                Config::default(),
                Box::new(self.wal.clone()),
                Box::new(self.snapshots.clone()),
            )
            .unwrap();
            db.recover().unwrap();
            db
        }

        /// What a power cut leaves behind: only flushed bytes.
        fn crash(&self) -> Self {
            Self {
                wal: self.wal.crash_image(),
                snapshots: self.snapshots.crash_image(),
            }
        }
    }

    #[test]
    fn committed_write_survives_crash() {
        let disk = Disk::new();
        {
            let db = disk.open();
            seed(&db);
            db.transaction(IsolationLevel::Serializable, |db, txn| {
                db.write(txn, &key("acct:A"), Value::Integer(750))
            })
            .unwrap();

            // In flight at the crash.
            let t7 = db.begin(IsolationLevel::Serializable).unwrap();
            db.write(&t7, &key("acct:A"), Value::Integer(1)).unwrap();
            std::mem::forget(db);
        }

        let db = disk.crash().open();
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(750)));
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(500)));
    }

    #[test]
    fn restart_replays_log_and_continues_ids() {
        let disk = Disk::new();
        let (last_id, last_lsn) = {
            let db = disk.open();
            seed(&db);
            let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
            db.write(&txn, &key("acct:B"), Value::Integer(42)).unwrap();
            let lsn = db.commit(&txn).unwrap();
            (txn.id(), lsn)
        };

        let db = disk.open();
        assert_eq!(db.committed_lsn(), last_lsn);
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(42)));
        let next = db.begin(IsolationLevel::ReadCommitted).unwrap();
        assert!(next.id() > last_id);
    }

    #[test]
    fn checkpoint_then_restart() {
        let disk = Disk::new();
        {
            let db = disk.open();
            seed(&db);
            let report = db.checkpoint().unwrap();
            assert_eq!(report.records, 2);
            assert_eq!(report.covered, db.committed_lsn());

            db.transaction(IsolationLevel::Serializable, |db, txn| {
                db.write(txn, &key("acct:C"), Value::Integer(3))
            })
            .unwrap();
        }

        let db = disk.crash().open();
        assert_eq!(db.record_count(), 3);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
        assert_eq!(committed(&db, "acct:C"), Some(Value::Integer(3)));
    }

    #[test]
    fn automatic_checkpoint_bounds_the_log() {
        let wal = MemoryBackend::new();
        let snapshots = MemoryBackend::new();
        let config = Config::default().checkpoint_wal_size(256);
        let db = Database::open_with_backends(
            config,
            Box::new(wal.clone()),
            Box::new(snapshots.clone()),
        )
        .unwrap();
        db.recover().unwrap();

        for i in 0..20 {
            db.transaction(IsolationLevel::ReadCommitted, |db, txn| {
                db.write(txn, &key(&format!("k:{i}")), Value::Integer(i))
            })
            .unwrap();
        }
        assert!(db.stats().checkpoints > 0);
        assert!(snapshots.durable_len() > 0);
        drop(db);

        let db = Database::open_with_backends(
            Config::default(),
            Box::new(wal.crash_image()),
            Box::new(snapshots.crash_image()),
        )
        .unwrap();
        db.recover().unwrap();
        assert_eq!(db.record_count(), 20);
    }

    #[test]
    fn failed_flush_is_durability_failure() {
        let memory = MemoryBackend::new();
        let (wal, switch) = FaultyBackend::new(memory.clone());
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(wal),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        db.recover().unwrap();
        seed(&db);

        switch.set(FaultPlan::FailFlush);
        let txn = db.begin(IsolationLevel::Serializable).unwrap();
        db.write(&txn, &key("acct:A"), Value::Integer(1)).unwrap();
        let err = db.commit(&txn).unwrap_err();
        assert!(matches!(err, CoreError::DurabilityFailure { .. }));
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert_eq!(db.stats().durability_failures, 1);

        switch.heal();
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
        db.transaction(IsolationLevel::Serializable, |db, txn| {
            db.write(txn, &key("acct:B"), Value::Integer(9))
        })
        .unwrap();
        drop(db);

        let db = Database::open_with_backends(
            Config::default(),
            Box::new(memory.crash_image()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        db.recover().unwrap();
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
        assert_eq!(committed(&db, "acct:B"), Some(Value::Integer(9)));
    }

    #[test]
    fn wal_size_counts_buffered_bytes_once() {
        let memory = MemoryBackend::new();
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(memory.clone()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        db.recover().unwrap();
        seed(&db);

        // An aborted writer leaves its abort entry buffered.
        let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
        db.write(&txn, &key("acct:A"), Value::Integer(1)).unwrap();
        db.abort(&txn).unwrap();

        let buffered = db.manager.wal().buffered_bytes() as u64;
        assert!(buffered > 0);
        assert_eq!(
            db.wal_size().unwrap(),
            memory.data().len() as u64 + buffered
        );

        db.manager.wal().flush().unwrap();
        assert_eq!(db.manager.wal().buffered_bytes(), 0);
        assert_eq!(db.wal_size().unwrap(), memory.data().len() as u64);
    }

    #[test]
    fn failed_commit_flushes_its_abort_when_cut_back_fails() {
        let memory = MemoryBackend::new();
        let (wal, switch) = FaultyBackend::new(memory.clone());
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(wal),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        db.recover().unwrap();
        seed(&db);

        // The commit's flush fails once and the partial append cannot be cut back.
        switch.set(FaultPlan::FlushGlitch);
        let txn = db.begin(IsolationLevel::Serializable).unwrap();
        db.write(&txn, &key("acct:A"), Value::Integer(1)).unwrap();
        let err = db.commit(&txn).unwrap_err();
        assert!(matches!(err, CoreError::DurabilityFailure { .. }));
        assert_eq!(switch.plan(), FaultPlan::FailTruncate);

        // The abort entry followed the stranded commit entry to storage.
        assert_eq!(db.manager.wal().buffered_bytes(), 0);
        assert_eq!(memory.durable_len(), memory.data().len());
        std::mem::forget(db);

        let db = Database::open_with_backends(
            Config::default(),
            Box::new(memory.crash_image()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        let report = db.recover().unwrap();
        assert_eq!(report.discarded_transactions, 1);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
    }

    #[test]
    fn torn_commit_is_discarded_on_recovery() {
        let memory = MemoryBackend::new();
        let (wal, switch) = FaultyBackend::new(memory.clone());
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(wal),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        db.recover().unwrap();
        seed(&db);

        switch.set(FaultPlan::TornAppend { valid_bytes: 9 });
        let txn = db.begin(IsolationLevel::Serializable).unwrap();
        db.write(&txn, &key("acct:A"), Value::Integer(1)).unwrap();
        assert!(db.commit(&txn).is_err());
        std::mem::forget(db);

        let db = Database::open_with_backends(
            Config::default(),
            Box::new(memory.crash_image()),
            Box::new(MemoryBackend::new()),
        )
        .unwrap();
        let report = db.recover().unwrap();
        assert_eq!(report.truncated_bytes, 9);
        assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(1000)));
    }

    // ========================================================================
    // Persistence tests that require a real file system
    // ========================================================================

    #[cfg(feature = "std")]
    mod persistence {
        use super::*;
        use tempfile::tempdir;

        #[test]
        fn reopen_directory() {
            let dir = tempdir().unwrap();
            let path = dir.path().join("ledger");
            {
                let db = Database::open(&path).unwrap();
                db.recover().unwrap();
                seed(&db);
                db.checkpoint().unwrap();
                db.transaction(IsolationLevel::Serializable, |db, txn| {
                    db.write(txn, &key("acct:A"), Value::Integer(900))
                })
                .unwrap();
                db.close().unwrap();
            }

            let db = Database::open(&path).unwrap();
            let report = db.recover().unwrap();
            assert_eq!(report.snapshot_records, 2);
            assert_eq!(report.replayed_transactions, 1);
            assert_eq!(db.path(), Some(path.as_path()));
            assert_eq!(committed(&db, "acct:A"), Some(Value::Integer(900)));
        }

        #[test]
        fn directory_is_locked_while_open() {
            let dir = tempdir().unwrap();
            let _db = Database::open(dir.path()).unwrap();
            assert!(matches!(
                Database::open(dir.path()),
                Err(CoreError::DatabaseLocked)
            ));
        }

        #[test]
        fn missing_directory_without_create() {
            let dir = tempdir().unwrap();
            let config = Config::default().create_if_missing(false);
            assert!(Database::open_with_config(&dir.path().join("absent"), config).is_err());
        }
    }
}
