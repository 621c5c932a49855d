//! Crash recovery testing for LedgerDB.
//!
//! This module simulates power cuts at various points around a commit and
//! verifies that recovery brings back exactly the acknowledged commits.
//!
//! ## Test Strategy
//!
//! Every scenario seeds two accounts, moves money between them, and cuts
//! power at a [`CrashPoint`]. Recovery then runs over only the bytes that
//! were flushed. The transfer must be either fully present or fully absent,
//! and the total balance must be unchanged.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ledgerdb_testkit::crash::{CrashRecoveryHarness, CrashPoint};
//!
//! let harness = CrashRecoveryHarness::new();
//! assert!(harness.run(CrashPoint::AfterCommit).passed);
//! ```

use crate::fixtures::{balance, move_funds, seed_accounts, transfer};
use ledgerdb_core::{Config, CoreError, CoreResult, Database, IsolationLevel, Key};
use ledgerdb_storage::{FaultPlan, FaultyBackend, MemoryBackend};

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The transfer's writes are staged but it never commits.
    BeforeCommit,
    /// The commit's log append is torn after `valid_bytes`.
    TornCommit {
        /// Bytes of the append that reach storage.
        valid_bytes: usize,
    },
    /// The commit flush fails, so the commit reports a durability failure.
    FailedFlush,
    /// The commit was flushed.
    AfterCommit,
    /// The commit was flushed and folded into a snapshot.
    AfterCheckpoint,
    /// The commit was acknowledged with `sync_on_commit` off and never flushed.
    UnsyncedCommit,
}

impl CrashPoint {
    /// Every crash point, with a torn write at a few offsets.
    pub fn all() -> Vec<Self> {
        vec![
            Self::BeforeCommit,
            Self::TornCommit { valid_bytes: 0 },
            Self::TornCommit { valid_bytes: 7 },
            Self::TornCommit { valid_bytes: 40 },
            Self::FailedFlush,
            Self::AfterCommit,
            Self::AfterCheckpoint,
            Self::UnsyncedCommit,
        ]
    }

    /// Whether the transfer must survive the crash.
    pub fn expects_commit(self) -> bool {
        matches!(self, Self::AfterCommit | Self::AfterCheckpoint)
    }
}

/// Result of a crash recovery test.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Whether the test passed.
    pub passed: bool,
    /// The crash point exercised.
    pub point: CrashPoint,
    /// Expected `(A, B)` balances after recovery.
    pub expected: (Option<i64>, Option<i64>),
    /// Actual `(A, B)` balances after recovery.
    pub actual: (Option<i64>, Option<i64>),
    /// Any error message.
    pub error: Option<String>,
}

impl CrashRecoveryResult {
    fn failed(point: CrashPoint, expected: (Option<i64>, Option<i64>), error: String) -> Self {
        Self {
            passed: false,
            point,
            expected,
            actual: (None, None),
            error: Some(error),
        }
    }
}

/// Test harness for crash recovery scenarios.
#[derive(Debug, Clone)]
pub struct CrashRecoveryHarness {
    /// Starting balance of account A.
    pub initial_a: i64,
    /// Starting balance of account B.
    pub initial_b: i64,
    /// Amount moved from A to B.
    pub amount: i64,
}

impl Default for CrashRecoveryHarness {
    fn default() -> Self {
        Self {
            initial_a: 1000,
            initial_b: 500,
            amount: 100,
        }
    }
}

const ACCOUNT_A: &str = "acct:A";
const ACCOUNT_B: &str = "acct:B";

impl CrashRecoveryHarness {
    /// Creates a harness with the default balances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every crash point.
    pub fn run_all(&self) -> Vec<CrashRecoveryResult> {
        CrashPoint::all().into_iter().map(|p| self.run(p)).collect()
    }

    /// Runs one crash scenario.
    pub fn run(&self, point: CrashPoint) -> CrashRecoveryResult {
        let expected = if point.expects_commit() {
            (
                Some(self.initial_a - self.amount),
                Some(self.initial_b + self.amount),
            )
        } else {
            (Some(self.initial_a), Some(self.initial_b))
        };

        let wal = MemoryBackend::new();
        let snapshots = MemoryBackend::new();
        if let Err(err) = self.drive(point, &wal, &snapshots) {
            return CrashRecoveryResult::failed(point, expected, format!("before crash: {err}"));
        }

        let recovered = match Self::recover(&wal, &snapshots) {
            Ok(db) => db,
            Err(err) => {
                return CrashRecoveryResult::failed(point, expected, format!("recovery: {err}"))
            }
        };
        let actual = (balance(&recovered, ACCOUNT_A), balance(&recovered, ACCOUNT_B));
        let passed = actual == expected;
        tracing::debug!(?point, ?expected, ?actual, passed, "crash scenario finished");

        CrashRecoveryResult {
            passed,
            point,
            expected,
            actual,
            error: (!passed).then(|| "balances differ after recovery".to_string()),
        }
    }

    /// Runs the workload up to the crash and abandons the database.
    fn drive(
        &self,
        point: CrashPoint,
        wal_memory: &MemoryBackend,
        snapshots: &MemoryBackend,
    ) -> CoreResult<()> {
        let (wal, switch) = FaultyBackend::new(wal_memory.clone());
        let config =
            Config::default().sync_on_commit(!matches!(point, CrashPoint::UnsyncedCommit));
        let db = Database::open_with_backends(config, Box::new(wal), Box::new(snapshots.clone()))?;
        db.recover()?;

        seed_accounts(&db, &[(ACCOUNT_A, self.initial_a), (ACCOUNT_B, self.initial_b)])?;
        if point == CrashPoint::UnsyncedCommit {
            // Make the seed durable; only the transfer should be at risk.
            db.checkpoint()?;
        }

        match point {
            CrashPoint::BeforeCommit => {
                let txn = db.begin(IsolationLevel::Serializable)?;
                move_funds(&db, &txn, &Key::from(ACCOUNT_A), &Key::from(ACCOUNT_B), self.amount)?;
            }
            CrashPoint::TornCommit { valid_bytes } => {
                switch.set(FaultPlan::TornAppend { valid_bytes });
                if transfer(&db, ACCOUNT_A, ACCOUNT_B, self.amount).is_ok() {
                    return Err(CoreError::invalid_operation("torn commit was acknowledged"));
                }
            }
            CrashPoint::FailedFlush => {
                switch.set(FaultPlan::FailFlush);
                match transfer(&db, ACCOUNT_A, ACCOUNT_B, self.amount) {
                    Err(CoreError::DurabilityFailure { .. }) => {}
                    other => {
                        return Err(CoreError::invalid_operation(format!(
                            "expected a durability failure, got {other:?}"
                        )))
                    }
                }
            }
            CrashPoint::AfterCommit | CrashPoint::UnsyncedCommit => {
                transfer(&db, ACCOUNT_A, ACCOUNT_B, self.amount)?;
            }
            CrashPoint::AfterCheckpoint => {
                transfer(&db, ACCOUNT_A, ACCOUNT_B, self.amount)?;
                db.checkpoint()?;
            }
        }

        // Power cut: no close, no flush.
        std::mem::forget(db);
        Ok(())
    }

    fn recover(wal: &MemoryBackend, snapshots: &MemoryBackend) -> CoreResult<Database> {
        let db = Database::open_with_backends(
            Config::default(),
            Box::new(wal.crash_image()),
            Box::new(snapshots.crash_image()),
        )?;
        db.recover()?;
        Ok(db)
    }
}
