//! Shared setup for the LedgerDB benchmarks.

#![warn(missing_docs)]

use ledgerdb_codec::Value;
use ledgerdb_core::{Config, CoreResult, Database, IsolationLevel, Key, NonNegative, RecordClass};
use rand::Rng;
use std::path::Path;

/// Random text value of `len` characters.
pub fn random_text(len: usize) -> Value {
    let mut rng = rand::thread_rng();
    Value::Text((0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect())
}

/// Random bytes value of `len` bytes.
pub fn random_bytes(len: usize) -> Value {
    let mut rng = rand::thread_rng();
    Value::Bytes((0..len).map(|_| rng.gen()).collect())
}

/// Keys `bench:000000`, `bench:000001`, ...
pub fn bench_keys(count: usize) -> Vec<Key> {
    (0..count).map(|i| Key::from(format!("bench:{i:06}"))).collect()
}

/// Opens and recovers a database in `dir`.
pub fn open_file_db(dir: &Path, sync_on_commit: bool) -> CoreResult<Database> {
    let config = Config::default()
        .sync_on_commit(sync_on_commit)
        .checkpoint_wal_size(u64::MAX);
    let db = Database::open_with_config(dir, config)?;
    db.recover()?;
    Ok(db)
}

/// Commits `count` accounts holding `balance` each under a non-negative rule.
pub fn seed_accounts(db: &Database, count: usize, balance: i64) -> CoreResult<Vec<Key>> {
    db.constraints().register(RecordClass::prefix("acct"), NonNegative);
    let keys: Vec<Key> = (0..count).map(|i| Key::from(format!("acct:{i:04}"))).collect();
    db.transaction(IsolationLevel::Serializable, |db, txn| {
        for key in &keys {
            db.write(txn, key, Value::Integer(balance))?;
        }
        Ok(())
    })?;
    Ok(keys)
}

/// Moves `amount` from `from` to `to` in one transaction.
pub fn transfer(db: &Database, from: &Key, to: &Key, amount: i64) -> CoreResult<()> {
    db.transaction(IsolationLevel::RepeatableRead, |db, txn| {
        let a = db.read(txn, from)?.as_i64().unwrap_or(0);
        let b = db.read(txn, to)?.as_i64().unwrap_or(0);
        db.write(txn, from, Value::Integer(a - amount))?;
        db.write(txn, to, Value::Integer(b + amount))
    })
}
