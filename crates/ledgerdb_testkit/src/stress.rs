//! Stress tests for LedgerDB.
//!
//! These helpers drive concurrent money transfers and counter increments
//! and report how many attempts committed, were retried after a deadlock or
//! timeout, or were rejected by a constraint.

use crate::fixtures::{account_names, seed_accounts, transfer};
use ledgerdb_codec::Value;
use ledgerdb_core::{CoreResult, Database, IsolationLevel, Key};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Committed transactions.
    pub committed: usize,
    /// Attempts aborted by a deadlock, timeout or no-wait refusal and retried.
    pub retried: usize,
    /// Attempts rejected for good (constraint violations, exhausted retries).
    pub rejected: usize,
    /// Total duration.
    pub duration: Duration,
    /// Commits per second.
    pub commits_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(committed: usize, retried: usize, rejected: usize, duration: Duration) -> Self {
        let commits_per_second = if duration.as_secs_f64() > 0.0 {
            committed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            committed,
            retried,
            rejected,
            duration,
            commits_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Committed: {}", self.committed);
        println!("Retried: {}", self.retried);
        println!("Rejected: {}", self.rejected);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} commits/sec", self.commits_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions attempted per thread.
    pub operations_per_thread: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Number of accounts.
    pub accounts: usize,
    /// Starting balance of every account.
    pub initial_balance: i64,
    /// Largest single transfer.
    pub max_amount: i64,
    /// Attempts per transaction before giving up.
    pub max_attempts: usize,
    /// Seed for the per-thread random generators.
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations_per_thread: 200,
            threads: 4,
            accounts: 8,
            initial_balance: 1_000,
            max_amount: 150,
            max_attempts: 20,
            seed: 0x1ed9e7,
        }
    }
}

impl StressConfig {
    /// Sum of all starting balances.
    pub fn total(&self) -> i64 {
        self.initial_balance * self.accounts as i64
    }
}

#[derive(Default)]
struct Tally {
    committed: AtomicUsize,
    retried: AtomicUsize,
    rejected: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: &CoreResult<()>, attempts: usize) {
        self.retried.fetch_add(attempts - 1, Ordering::Relaxed);
        let counter = if outcome.is_ok() {
            &self.committed
        } else {
            &self.rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self, started: Instant) -> StressTestResult {
        StressTestResult::new(
            self.committed.load(Ordering::Relaxed),
            self.retried.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            started.elapsed(),
        )
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. Returns the outcome and the attempts made.
fn with_retries<F>(max_attempts: usize, mut op: F) -> (CoreResult<()>, usize)
where
    F: FnMut() -> CoreResult<()>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match op() {
            Err(err) if err.is_retryable() && attempts < max_attempts => thread::yield_now(),
            outcome => return (outcome, attempts),
        }
    }
}

/// Seeds `config.accounts` accounts, then runs random transfers between
/// them from `config.threads` threads.
///
/// Transfers that would overdraw an account are rejected by the
/// non-negative rule. Whatever happens, money is neither created nor lost.
pub fn stress_concurrent_transfers(db: Arc<Database>, config: &StressConfig) -> StressTestResult {
    let names = Arc::new(account_names(config.accounts));
    let seed: Vec<_> = names
        .iter()
        .map(|n| (n.as_str(), config.initial_balance))
        .collect();
    seed_accounts(&db, &seed).expect("Failed to seed accounts");

    let tally = Arc::new(Tally::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = Arc::clone(&db);
            let names = Arc::clone(&names);
            let tally = Arc::clone(&tally);
            let config = config.clone();

            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(t as u64));
                for _ in 0..config.operations_per_thread {
                    let from = rng.gen_range(0..names.len());
                    let to = (from + rng.gen_range(1..names.len())) % names.len();
                    let amount = rng.gen_range(1..=config.max_amount);

                    let (outcome, attempts) = with_retries(config.max_attempts, || {
                        transfer(&db, &names[from], &names[to], amount).map(|_| ())
                    });
                    tally.record(&outcome, attempts);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    tally.finish(started)
}

/// Increments one counter from `threads` threads, `increments` times each.
///
/// At repeatable read or above the final value equals the number of
/// committed increments; read committed may lose updates.
pub fn stress_hot_counter(
    db: Arc<Database>,
    threads: usize,
    increments: usize,
    isolation: IsolationLevel,
) -> (StressTestResult, i64) {
    let key = Key::from("counter:hot");
    let tally = Arc::new(Tally::default());
    let started = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let db = Arc::clone(&db);
            let key = key.clone();
            let tally = Arc::clone(&tally);

            thread::spawn(move || {
                for _ in 0..increments {
                    let (outcome, attempts) = with_retries(usize::MAX, || {
                        db.transaction(isolation, |db, txn| {
                            let current =
                                db.get(txn, &key)?.and_then(|v| v.as_i64()).unwrap_or(0);
                            db.write(txn, &key, Value::Integer(current + 1))
                        })
                    });
                    tally.record(&outcome, attempts);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("Stress thread panicked");
    }

    let result = tally.finish(started);
    let value = db
        .transaction(IsolationLevel::ReadCommitted, |db, txn| db.get(txn, &key))
        .ok()
        .flatten()
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    (result, value)
}

/// Commits `operations` single-key writes from one thread.
pub fn stress_sequential_commits(db: &Database, operations: usize) -> StressTestResult {
    let started = Instant::now();
    let mut committed = 0usize;
    let mut rejected = 0usize;

    for i in 0..operations {
        let key = Key::from(format!("seq:{:06}", i % 1024));
        match db.transaction(IsolationLevel::ReadCommitted, |db, txn| {
            db.write(txn, &key, Value::Integer(i as i64))
        }) {
            Ok(()) => committed += 1,
            Err(_) => rejected += 1,
        }
    }

    StressTestResult::new(committed, 0, rejected, started.elapsed())
}
