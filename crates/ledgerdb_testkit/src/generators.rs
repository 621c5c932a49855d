//! Property-based test generators using proptest.
//!
//! Provides strategies for random values, keys and transaction scripts, plus
//! a plain in-memory model that a script can be checked against.

use ledgerdb_codec::Value;
use ledgerdb_core::{CoreResult, Database, IsolationLevel, Key, SavepointToken, TransactionHandle};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Keys scripts draw from. A small set keeps overwrites and deletes likely.
pub const SCRIPT_KEYS: [&str; 6] = ["k:a", "k:b", "k:c", "k:d", "k:e", "k:f"];

/// Strategy for generating record values of every kind.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        1 => Just(Value::Null),
        1 => any::<bool>().prop_map(Value::Bool),
        4 => any::<i64>().prop_map(Value::Integer),
        2 => "[a-z0-9 ]{0,24}".prop_map(Value::Text),
        1 => prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
    ]
}

/// Strategy for picking a key from [`SCRIPT_KEYS`].
pub fn key_strategy() -> impl Strategy<Value = Key> {
    prop::sample::select(SCRIPT_KEYS.to_vec()).prop_map(Key::from)
}

/// Strategy for generating an isolation level.
pub fn isolation_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![
        Just(IsolationLevel::ReadUncommitted),
        Just(IsolationLevel::ReadCommitted),
        Just(IsolationLevel::RepeatableRead),
        Just(IsolationLevel::Serializable),
    ]
}

/// One step of a transaction script.
#[derive(Debug, Clone)]
pub enum ScriptOp {
    /// Write a value.
    Write {
        /// Target key.
        key: Key,
        /// New value.
        value: Value,
    },
    /// Delete a key (missing keys included).
    Delete {
        /// Target key.
        key: Key,
    },
    /// Set a savepoint.
    Savepoint,
    /// Roll back to the newest live savepoint, if any.
    RollbackToLast,
    /// Release the newest live savepoint, if any.
    ReleaseLast,
}

/// Strategy for generating one script step.
pub fn script_op_strategy() -> impl Strategy<Value = ScriptOp> {
    prop_oneof![
        6 => (key_strategy(), value_strategy())
            .prop_map(|(key, value)| ScriptOp::Write { key, value }),
        2 => key_strategy().prop_map(|key| ScriptOp::Delete { key }),
        2 => Just(ScriptOp::Savepoint),
        1 => Just(ScriptOp::RollbackToLast),
        1 => Just(ScriptOp::ReleaseLast),
    ]
}

/// Strategy for generating a script of `min_ops..max_ops` steps.
pub fn script_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<ScriptOp>> {
    prop::collection::vec(script_op_strategy(), min_ops..max_ops)
}

/// Expected record state, maintained alongside a real transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Model {
    /// Visible records.
    pub records: BTreeMap<Key, Value>,
    savepoints: Vec<BTreeMap<Key, Value>>,
}

impl Model {
    /// Starts from a committed state.
    pub fn new(records: BTreeMap<Key, Value>) -> Self {
        Self {
            records,
            savepoints: Vec::new(),
        }
    }

    /// Applies one step.
    pub fn apply(&mut self, op: &ScriptOp) {
        match op {
            ScriptOp::Write { key, value } => {
                self.records.insert(key.clone(), value.clone());
            }
            ScriptOp::Delete { key } => {
                self.records.remove(key);
            }
            ScriptOp::Savepoint => self.savepoints.push(self.records.clone()),
            ScriptOp::RollbackToLast => {
                if let Some(saved) = self.savepoints.last() {
                    self.records = saved.clone();
                }
            }
            ScriptOp::ReleaseLast => {
                self.savepoints.pop();
            }
        }
    }
}

/// Runs `ops` inside `txn`, mirroring each step into a model that starts
/// from `committed`. Returns the model's final state.
pub fn run_script(
    db: &Database,
    txn: &TransactionHandle,
    ops: &[ScriptOp],
    committed: BTreeMap<Key, Value>,
) -> CoreResult<Model> {
    let mut model = Model::new(committed);
    let mut tokens: Vec<SavepointToken> = Vec::new();

    for (i, op) in ops.iter().enumerate() {
        match op {
            ScriptOp::Write { key, value } => db.write(txn, key, value.clone())?,
            ScriptOp::Delete { key } => db.delete(txn, key)?,
            ScriptOp::Savepoint => tokens.push(db.savepoint(txn, format!("sp{i}"))?),
            ScriptOp::RollbackToLast => {
                if let Some(token) = tokens.last() {
                    db.rollback_to(txn, token)?;
                }
            }
            ScriptOp::ReleaseLast => {
                if let Some(token) = tokens.pop() {
                    db.release_savepoint(txn, &token)?;
                }
            }
        }
        model.apply(op);
    }

    Ok(model)
}

/// Every [`SCRIPT_KEYS`] record visible to `txn`.
pub fn visible_state(db: &Database, txn: &TransactionHandle) -> CoreResult<BTreeMap<Key, Value>> {
    let mut state = BTreeMap::new();
    for key in SCRIPT_KEYS.iter().copied().map(Key::from) {
        if let Some(value) = db.get(txn, &key)? {
            state.insert(key, value);
        }
    }
    Ok(state)
}

/// Every committed [`SCRIPT_KEYS`] record.
pub fn committed_state(db: &Database) -> CoreResult<BTreeMap<Key, Value>> {
    db.transaction(IsolationLevel::ReadCommitted, visible_state)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::MemoryDisk;
    use ledgerdb_core::Config;

    fn commit_script(db: &Database, isolation: IsolationLevel, ops: &[ScriptOp]) -> Model {
        let committed = committed_state(db).unwrap();
        let txn = db.begin(isolation).unwrap();
        let model = run_script(db, &txn, ops, committed).unwrap();
        db.commit(&txn).unwrap();
        model
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn transaction_sees_its_own_script(
            isolation in isolation_strategy(),
            ops in script_strategy(1, 40),
        ) {
            let db = Database::open_in_memory().unwrap();
            let txn = db.begin(isolation).unwrap();
            let model = run_script(&db, &txn, &ops, BTreeMap::new()).unwrap();
            prop_assert_eq!(visible_state(&db, &txn).unwrap(), model.records);
            db.abort(&txn).unwrap();
        }

        #[test]
        fn committed_script_matches_model(
            isolation in isolation_strategy(),
            first in script_strategy(0, 20),
            second in script_strategy(1, 40),
        ) {
            let db = Database::open_in_memory().unwrap();
            commit_script(&db, IsolationLevel::Serializable, &first);
            let model = commit_script(&db, isolation, &second);
            prop_assert_eq!(committed_state(&db).unwrap(), model.records);
        }

        #[test]
        fn aborted_script_changes_nothing(
            setup in script_strategy(0, 20),
            ops in script_strategy(1, 40),
        ) {
            let db = Database::open_in_memory().unwrap();
            let before = commit_script(&db, IsolationLevel::Serializable, &setup).records;

            let txn = db.begin(IsolationLevel::RepeatableRead).unwrap();
            run_script(&db, &txn, &ops, before.clone()).unwrap();
            db.abort(&txn).unwrap();

            prop_assert_eq!(committed_state(&db).unwrap(), before);
        }

        #[test]
        fn committed_state_survives_crash(
            scripts in prop::collection::vec(script_strategy(1, 15), 1..5),
            checkpoint_after in 0usize..5,
        ) {
            let disk = MemoryDisk::new();
            let db = disk.open(Config::default()).unwrap();
            let mut expected = BTreeMap::new();
            for (i, ops) in scripts.iter().enumerate() {
                expected = commit_script(&db, IsolationLevel::Serializable, ops).records;
                if i == checkpoint_after {
                    db.checkpoint().unwrap();
                }
            }

            // An uncommitted script is in flight at the crash.
            let txn = db.begin(IsolationLevel::Serializable).unwrap();
            run_script(&db, &txn, &scripts[0], expected.clone()).unwrap();
            std::mem::forget(txn);
            std::mem::forget(db);

            let recovered = disk.crash().open(Config::default()).unwrap();
            prop_assert_eq!(committed_state(&recovered).unwrap(), expected);
        }
    }
}
