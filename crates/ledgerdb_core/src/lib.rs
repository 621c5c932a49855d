//! # LedgerDB Core
//!
//! Transactional storage core for LedgerDB.
//!
//! This crate provides:
//! - A record store holding committed values and per-transaction staged writes
//! - WAL (Write-Ahead Log) for durability, with crash recovery
//! - A lock manager with four isolation levels and deadlock detection
//! - Declarative constraints checked on every write
//! - Savepoints with partial rollback
//! - Snapshots and checkpoints that bound the log
//!
//! ## Example
//!
//! ```rust
//! use ledgerdb_core::{Database, IsolationLevel, Key, NonNegative, RecordClass};
//! use ledgerdb_codec::Value;
//!
//! let db = Database::open_in_memory().unwrap();
//! db.constraints().register(RecordClass::prefix("acct"), NonNegative);
//!
//! db.transaction(IsolationLevel::Serializable, |db, txn| {
//!     db.write(txn, &Key::from("acct:A"), Value::Integer(1000))?;
//!     db.write(txn, &Key::from("acct:B"), Value::Integer(500))
//! })
//! .unwrap();
//!
//! let txn = db.begin(IsolationLevel::ReadCommitted).unwrap();
//! assert!(db.write(&txn, &Key::from("acct:A"), Value::Integer(-50)).is_err());
//! assert!(txn.is_active());
//! db.abort(&txn).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod constraint;
mod database;
#[cfg(feature = "std")]
mod dir;
mod error;
mod lock;
mod recovery;
mod snapshot;
mod stats;
mod store;
mod transaction;
mod types;
pub mod wal;

pub use config::Config;
pub use constraint::{
    Constraint, ConstraintEngine, NonNegative, NotNull, Predicate, Range, RecordClass, Violation,
};
pub use database::Database;
#[cfg(feature = "std")]
pub use dir::DatabaseDir;
pub use error::{CoreError, CoreResult};
pub use lock::{Acquired, LockManager, LockMode, ModeSet, Resource, WaitForGraph};
pub use recovery::{RecoveryPlan, RecoveryReport};
pub use snapshot::{decode_image, encode_image, scan_images, ImageInfo, Snapshot, SnapshotStore};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use store::RecordStore;
pub use transaction::{
    CheckpointReport, SavepointToken, TransactionHandle, TransactionManager, TransactionState,
};
pub use types::{IsolationLevel, Key, SequenceNumber, TransactionId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
