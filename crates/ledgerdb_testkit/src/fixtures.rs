//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases, seeding
//! accounts and restarting a database over the bytes it left behind.

use ledgerdb_codec::Value;
use ledgerdb_core::{
    Config, CoreResult, Database, IsolationLevel, Key, NonNegative, RecordClass, SequenceNumber,
    TransactionHandle,
};
use ledgerdb_storage::MemoryBackend;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Class under which [`seed_accounts`] stores balances.
pub const ACCOUNT_CLASS: &str = "acct";

/// The two backends of a database, kept outside it.
///
/// Clones share bytes, so a database can be dropped and reopened over the
/// same disk, or over [`MemoryDisk::crash`] to keep only flushed bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryDisk {
    /// WAL bytes.
    pub wal: MemoryBackend,
    /// Snapshot bytes.
    pub snapshots: MemoryBackend,
}

impl MemoryDisk {
    /// Creates an empty disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a database over this disk without recovering it.
    pub fn open_unrecovered(&self, config: Config) -> CoreResult<Database> {
        Database::open_with_backends(
            config,
            Box::new(self.wal.clone()),
            Box::new(self.snapshots.clone()),
        )
    }

    /// Opens and recovers a database over this disk.
    pub fn open(&self, config: Config) -> CoreResult<Database> {
        let db = self.open_unrecovered(config)?;
        db.recover()?;
        Ok(db)
    }

    /// An independent disk holding only what was flushed.
    pub fn crash(&self) -> Self {
        Self {
            wal: self.wal.crash_image(),
            snapshots: self.snapshots.crash_image(),
        }
    }
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Database,
    /// Shared disk for in-memory databases.
    disk: Option<MemoryDisk>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
    config: Config,
}

impl TestDatabase {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with_config(Config::default())
    }

    /// Creates a new in-memory test database with `config`.
    pub fn memory_with_config(config: Config) -> Self {
        let disk = MemoryDisk::new();
        let db = disk
            .open(config.clone())
            .expect("Failed to open in-memory database");
        Self {
            db,
            disk: Some(disk),
            temp_dir: None,
            config,
        }
    }

    /// Creates a new file-based test database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config::default();
        let db = open_dir(&temp_dir.path().join("db"), config.clone());
        Self {
            db,
            disk: None,
            temp_dir: Some(temp_dir),
            config,
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("db"))
    }

    /// Closes the database and opens it again over the same storage.
    pub fn restart(self) -> Self {
        let Self {
            db,
            disk,
            temp_dir,
            config,
        } = self;
        drop(db);

        let db = match (&disk, &temp_dir) {
            (Some(disk), _) => disk.open(config.clone()).expect("Failed to reopen database"),
            (None, Some(dir)) => open_dir(&dir.path().join("db"), config.clone()),
            (None, None) => unreachable!("test database without storage"),
        };
        Self {
            db,
            disk,
            temp_dir,
            config,
        }
    }

    /// Simulates a power cut: the database is abandoned without closing,
    /// and a new one recovers from only the flushed bytes.
    ///
    /// Only available for in-memory databases.
    pub fn crash(self) -> Self {
        let Self {
            db, disk, config, ..
        } = self;
        let disk = disk.expect("crash needs an in-memory database").crash();
        std::mem::forget(db);

        let db = disk.open(config.clone()).expect("Failed to recover database");
        Self {
            db,
            disk: Some(disk),
            temp_dir: None,
            config,
        }
    }
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

fn open_dir(path: &Path, config: Config) -> Database {
    let db = Database::open_with_config(path, config).expect("Failed to open file database");
    db.recover().expect("Failed to recover file database");
    db
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use ledgerdb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         assert_eq!(db.record_count(), 0);
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    f(&test_db.db)
}

/// Runs a test with a temporary file-based database.
pub fn with_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let test_db = TestDatabase::file();
    let path = test_db.path().expect("File database should have a path");
    f(&test_db.db, &path)
}

/// Runs a test with an in-memory database holding `accounts`.
pub fn with_accounts<F, R>(accounts: &[(&str, i64)], f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let test_db = TestDatabase::memory();
    seed_accounts(&test_db.db, accounts).expect("Failed to seed accounts");
    f(&test_db.db)
}

/// Registers the non-negative balance rule and commits `accounts` in one
/// transaction.
pub fn seed_accounts(db: &Database, accounts: &[(&str, i64)]) -> CoreResult<SequenceNumber> {
    db.constraints()
        .register(RecordClass::prefix(ACCOUNT_CLASS), NonNegative);
    let txn = db.begin(IsolationLevel::Serializable)?;
    for (key, balance) in accounts {
        db.write(&txn, &Key::from(*key), Value::Integer(*balance))?;
    }
    db.commit(&txn)
}

/// Names `count` accounts `acct:0000`, `acct:0001`, ...
pub fn account_names(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| format!("{ACCOUNT_CLASS}:{i:04}"))
        .collect()
}

/// Moves `amount` from one account to another in a serializable
/// transaction. Returns the commit sequence number.
pub fn transfer(db: &Database, from: &str, to: &str, amount: i64) -> CoreResult<SequenceNumber> {
    let txn = db.begin(IsolationLevel::Serializable)?;
    let result = move_funds(db, &txn, &Key::from(from), &Key::from(to), amount)
        .and_then(|()| db.commit(&txn));
    if result.is_err() && txn.is_active() {
        db.abort(&txn)?;
    }
    result
}

/// Debits `from` and credits `to` inside `txn`.
pub fn move_funds(
    db: &Database,
    txn: &TransactionHandle,
    from: &Key,
    to: &Key,
    amount: i64,
) -> CoreResult<()> {
    let a = db.read(txn, from)?.as_i64().unwrap_or(0);
    let b = db.read(txn, to)?.as_i64().unwrap_or(0);
    db.write(txn, from, Value::Integer(a - amount))?;
    db.write(txn, to, Value::Integer(b + amount))
}

/// Committed balance of `key`, if it exists and is an integer.
pub fn balance(db: &Database, key: &str) -> Option<i64> {
    db.transaction(IsolationLevel::ReadCommitted, |db, txn| {
        db.get(txn, &Key::from(key))
    })
    .expect("Failed to read balance")
    .and_then(|v| v.as_i64())
}

/// Sum of every committed integer in `class`.
pub fn total_balance(db: &Database, class: &str) -> i64 {
    db.transaction(IsolationLevel::Serializable, |db, txn| {
        let mut total = 0;
        for key in db.scan_keys(txn, &RecordClass::prefix(class))? {
            total += db.read(txn, &key)?.as_i64().unwrap_or(0);
        }
        Ok(total)
    })
    .expect("Failed to sum balances")
}
