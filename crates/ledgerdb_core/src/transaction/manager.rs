//! Transaction manager.

use crate::config::Config;
use crate::constraint::{ConstraintEngine, RecordClass};
use crate::error::{CoreError, CoreResult};
use crate::lock::{Acquired, LockManager, LockMode, Resource};
use crate::recovery::{RecoveryPlan, RecoveryReport};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::stats::DatabaseStats;
use crate::store::RecordStore;
use crate::transaction::savepoint::{SavepointMark, SavepointToken};
use crate::transaction::state::{
    HeldLock, Mutation, Transaction, TransactionHandle, TransactionState,
};
use crate::types::{IsolationLevel, Key, SequenceNumber, TransactionId};
use crate::wal::{LogRecord, WalManager};
use ledgerdb_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    /// Highest commit sequence in the new snapshot.
    pub covered: SequenceNumber,
    /// Records in the snapshot.
    pub records: usize,
    /// Size of the snapshot image in bytes.
    pub snapshot_bytes: u64,
}

/// Coordinates transactions over the record store.
///
/// Isolation comes from two-phase locking through the [`LockManager`];
/// durability from appending each commit's writes to the WAL before they
/// are applied to the [`RecordStore`]. Commits take the commit gate for
/// reading; checkpoints take it for writing, so a snapshot never sees a
/// commit that is in the log but not yet in the store.
pub struct TransactionManager {
    config: Config,
    store: Arc<RecordStore>,
    wal: Arc<WalManager>,
    snapshots: Arc<SnapshotStore>,
    locks: LockManager,
    constraints: Arc<ConstraintEngine>,
    stats: Arc<DatabaseStats>,
    next_txid: AtomicU64,
    committed_seq: AtomicU64,
    active: RwLock<HashMap<TransactionId, TransactionHandle>>,
    commit_gate: RwLock<()>,
    checkpointing: Mutex<()>,
    recovered: AtomicBool,
}

impl TransactionManager {
    /// Creates a transaction manager. [`TransactionManager::recover`] must
    /// run before the first `begin`.
    pub fn new(
        config: Config,
        wal: Arc<WalManager>,
        snapshots: Arc<SnapshotStore>,
        stats: Arc<DatabaseStats>,
    ) -> Self {
        let locks = LockManager::new(config.lock_shards, Arc::clone(&stats));
        Self {
            config,
            store: Arc::new(RecordStore::new()),
            wal,
            snapshots,
            locks,
            constraints: Arc::new(ConstraintEngine::new()),
            stats,
            next_txid: AtomicU64::new(1),
            committed_seq: AtomicU64::new(0),
            active: RwLock::new(HashMap::new()),
            commit_gate: RwLock::new(()),
            checkpointing: Mutex::new(()),
            recovered: AtomicBool::new(false),
        }
    }

    /// Rebuilds the committed state from the last snapshot and the WAL.
    ///
    /// Runs once, before any transaction begins.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        let _gate = self.commit_gate.write();
        if self.recovered.load(Ordering::Acquire) {
            return Err(CoreError::invalid_operation("recovery already ran"));
        }

        let snapshot = self.snapshots.load_latest()?.unwrap_or_default();
        let scan = self.wal.scan()?;
        let plan = RecoveryPlan::build(&scan.entries, snapshot.covered);

        if let Some(marker) = plan.checkpoint_marker() {
            if snapshot.covered < marker {
                return Err(CoreError::snapshot_corruption(format!(
                    "log was checkpointed at {marker} but the newest snapshot covers {}",
                    snapshot.covered
                )));
            }
        }

        let snapshot_records = snapshot.records.len();
        self.store.load(snapshot.records);
        let replayed = plan.apply(&self.store);

        let next_txid = plan
            .max_txid()
            .map_or(1, |t| t.as_u64() + 1)
            .max(snapshot.next_txid.as_u64())
            .max(1);
        let last_commit = plan.last_commit().max(snapshot.covered);
        self.next_txid.store(next_txid, Ordering::SeqCst);
        self.committed_seq.store(last_commit.as_u64(), Ordering::SeqCst);
        self.wal
            .advance_lsn(plan.max_lsn().max(snapshot.covered).next());
        self.recovered.store(true, Ordering::Release);

        let report = RecoveryReport {
            snapshot_seq: snapshot.covered,
            snapshot_records,
            wal_entries: scan.entries.len(),
            replayed_transactions: replayed,
            discarded_transactions: plan.discarded(),
            truncated_bytes: scan.truncated_bytes,
            next_txid: TransactionId::new(next_txid),
            last_commit,
            records: self.store.len(),
        };
        tracing::info!(
            snapshot = %report.snapshot_seq,
            replayed = report.replayed_transactions,
            discarded = report.discarded_transactions,
            truncated = report.truncated_bytes,
            records = report.records,
            "recovery complete"
        );
        Ok(report)
    }

    /// Whether recovery has run.
    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    /// Starts a transaction at `isolation`.
    pub fn begin(&self, isolation: IsolationLevel) -> CoreResult<TransactionHandle> {
        if !self.is_recovered() {
            return Err(CoreError::RecoveryRequired);
        }
        let txid = TransactionId::new(self.next_txid.fetch_add(1, Ordering::SeqCst));
        let handle = TransactionHandle::new(txid, isolation);
        self.active.write().insert(txid, handle.clone());
        self.stats.record_transaction_start();
        tracing::debug!(%txid, %isolation, "transaction started");
        Ok(handle)
    }

    /// Requests a lock for `handle`, turning timeouts and deadlocks into an
    /// abort. `track` records the grant so it is released at transaction end.
    fn lock(
        &self,
        handle: &TransactionHandle,
        resource: &Resource,
        mode: LockMode,
        track: bool,
    ) -> CoreResult<Acquired> {
        let txid = handle.id();
        let result = self.locks.acquire(
            txid,
            resource,
            mode,
            self.config.lock_timeout,
            &handle.shared.cancelled,
        );

        match result {
            Ok(acquired) => {
                let mut txn = handle.lock();
                if txn.state != TransactionState::Active {
                    // Aborted from another thread while we were being granted.
                    if acquired == Acquired::Granted {
                        self.locks.release_mode(txid, resource, mode);
                    }
                    return Err(CoreError::TransactionClosed {
                        txid,
                        state: txn.state,
                    });
                }
                if track && acquired == Acquired::Granted {
                    txn.locks.push(HeldLock {
                        resource: resource.clone(),
                        mode,
                    });
                }
                Ok(acquired)
            }
            Err(err) => {
                match &err {
                    CoreError::LockTimeout { .. } => {
                        self.stats.record_lock_timeout();
                        self.abort_internal(handle, "lock wait timed out");
                    }
                    CoreError::Deadlock { .. } => {
                        self.stats.record_deadlock();
                        self.abort_internal(handle, "deadlock victim");
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Gives back a grant that turned out to be unneeded.
    fn unlock_last(&self, handle: &TransactionHandle, resource: &Resource, mode: LockMode) {
        let mut txn = handle.lock();
        if let Some(pos) = txn
            .locks
            .iter()
            .rposition(|l| &l.resource == resource && l.mode == mode)
        {
            txn.locks.remove(pos);
        }
        self.locks.release_mode(handle.id(), resource, mode);
    }

    /// Reads `key`, returning `None` if it has no visible value.
    pub fn get(&self, handle: &TransactionHandle, key: &Key) -> CoreResult<Option<Value>> {
        let txid = handle.id();
        let isolation = handle.isolation();

        if handle.lock_active()?.has_written(key) {
            // Own writes are covered by the exclusive lock already held.
            self.stats.record_read();
            return Ok(self.store.read(key, txid, false));
        }

        if isolation.locks_predicate() {
            self.lock(handle, &Resource::Predicate, LockMode::Shared, true)?;
        }

        let resource = Resource::Key(key.clone());
        let keep = isolation.holds_read_locks();
        let acquired = if isolation.locks_reads() {
            Some(self.lock(handle, &resource, LockMode::Shared, keep)?)
        } else {
            None
        };

        let value = self.store.read(key, txid, isolation.allows_dirty_reads());

        if !keep && acquired == Some(Acquired::Granted) {
            self.locks.release_mode(txid, &resource, LockMode::Shared);
        }
        self.stats.record_read();
        Ok(value)
    }

    /// Reads `key`, failing with `NotFound` if it has no visible value.
    pub fn read(&self, handle: &TransactionHandle, key: &Key) -> CoreResult<Value> {
        self.get(handle, key)?.ok_or_else(|| CoreError::NotFound {
            key: key.clone(),
            txid: handle.id(),
        })
    }

    fn check(
        &self,
        handle: &TransactionHandle,
        key: &Key,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> CoreResult<()> {
        self.constraints.validate(key, old, new).map_err(|violation| {
            self.stats.record_constraint_violation();
            CoreError::ConstraintViolation {
                key: violation.key,
                txid: handle.id(),
                rule: violation.rule,
                reason: violation.reason,
            }
        })
    }

    fn mutate(&self, handle: &TransactionHandle, key: &Key, new: Option<Value>) -> CoreResult<()> {
        let txid = handle.id();
        let old = {
            let _txn = handle.lock_active()?;
            self.store.read(key, txid, false)
        };
        self.check(handle, key, old.as_ref(), new.as_ref())?;

        let intent = self.lock(handle, &Resource::Predicate, LockMode::IntentExclusive, true)?;
        // A rejected write must not keep a fresh intent lock blocking every
        // serializable reader.
        let release_intent = || {
            if intent == Acquired::Granted && handle.is_active() {
                self.unlock_last(handle, &Resource::Predicate, LockMode::IntentExclusive);
            }
        };

        let resource = Resource::Key(key.clone());
        let held_before = handle.lock().holds(&resource, LockMode::Exclusive);
        let acquired = match self.lock(handle, &resource, LockMode::Exclusive, true) {
            Ok(acquired) => acquired,
            Err(err) => {
                release_intent();
                return Err(err);
            }
        };

        // The value may have changed while we waited for the lock.
        let current = self.store.read(key, txid, false);
        if current != old {
            if let Err(err) = self.check(handle, key, current.as_ref(), new.as_ref()) {
                if acquired == Acquired::Granted && !held_before {
                    self.unlock_last(handle, &resource, LockMode::Exclusive);
                }
                release_intent();
                return Err(err);
            }
        }

        let mut txn = handle.lock_active()?;
        let first_touch = !txn.has_written(key);
        if let Err(err) = self.store.stage(key, txid, new.clone()) {
            self.finish_abort(handle, &mut txn, "staging conflict");
            return Err(err);
        }
        if new.is_some() {
            self.stats.record_write();
        } else {
            self.stats.record_delete();
        }
        tracing::trace!(%txid, %key, first_touch, "write staged");
        txn.mutations.push(Mutation {
            key: key.clone(),
            before: current,
            after: new,
            first_touch,
        });
        Ok(())
    }

    /// Stages `value` for `key`.
    pub fn write(&self, handle: &TransactionHandle, key: &Key, value: Value) -> CoreResult<()> {
        self.mutate(handle, key, Some(value))
    }

    /// Stages a delete of `key`.
    pub fn delete(&self, handle: &TransactionHandle, key: &Key) -> CoreResult<()> {
        self.mutate(handle, key, None)
    }

    /// Lists visible keys in `class`. Serializable transactions lock the
    /// predicate, so no matching key can appear or vanish until they end.
    pub fn scan_keys(&self, handle: &TransactionHandle, class: &RecordClass) -> CoreResult<Vec<Key>> {
        let isolation = handle.isolation();
        drop(handle.lock_active()?);
        if isolation.locks_predicate() {
            self.lock(handle, &Resource::Predicate, LockMode::Shared, true)?;
        }
        self.stats.record_scan();
        Ok(self
            .store
            .keys_matching(handle.id(), isolation.allows_dirty_reads(), |k| class.matches(k)))
    }

    /// Marks the current position in the transaction.
    pub fn savepoint(
        &self,
        handle: &TransactionHandle,
        name: impl Into<String>,
    ) -> CoreResult<SavepointToken> {
        let mut txn = handle.lock_active()?;
        let mark = SavepointMark {
            mutation_len: txn.mutations.len(),
            lock_len: txn.locks.len(),
        };
        let token = txn.savepoints.mark(name, mark);
        tracing::debug!(txid = %handle.id(), savepoint = token.name(), "savepoint set");
        Ok(token)
    }

    /// Undoes every write made after `token`, newest first.
    ///
    /// Exclusive locks taken after the savepoint that no surviving write
    /// needs are released (or downgraded, after an upgrade). Shared locks
    /// stay. The savepoint itself stays live; later ones are discarded.
    pub fn rollback_to_savepoint(
        &self,
        handle: &TransactionHandle,
        token: &SavepointToken,
    ) -> CoreResult<()> {
        let txid = handle.id();
        let mut txn = handle.lock_active()?;
        let mark = txn.savepoints.rollback_to(token)?;

        let undone = txn.mutations.split_off(mark.mutation_len);
        for m in undone.iter().rev() {
            if m.first_touch {
                self.store.unstage(&m.key, txid);
            } else {
                self.store.stage(&m.key, txid, m.before.clone())?;
            }
        }

        let lock_len = mark.lock_len.min(txn.locks.len());
        let later = txn.locks.split_off(lock_len);
        for lock in later {
            let needed = match (&lock.resource, lock.mode) {
                (Resource::Key(key), LockMode::Exclusive) => txn.has_written(key),
                (Resource::Predicate, LockMode::IntentExclusive) => !txn.mutations.is_empty(),
                _ => true,
            };
            if needed {
                txn.locks.push(lock);
            } else {
                self.locks.release_mode(txid, &lock.resource, lock.mode);
            }
        }

        self.stats.record_savepoint_rollback();
        tracing::debug!(%txid, savepoint = token.name(), undone = undone.len(), "rolled back to savepoint");
        Ok(())
    }

    /// Forgets `token` and every later savepoint. Writes are kept.
    pub fn release_savepoint(
        &self,
        handle: &TransactionHandle,
        token: &SavepointToken,
    ) -> CoreResult<()> {
        handle.lock_active()?.savepoints.release(token)
    }

    /// Commits the transaction and returns its commit sequence number.
    ///
    /// The writes and the commit entry are flushed to the WAL before they
    /// become visible. If the flush fails the transaction is aborted and
    /// `DurabilityFailure` is returned. A transaction without writes logs
    /// nothing and returns the current commit sequence.
    pub fn commit(&self, handle: &TransactionHandle) -> CoreResult<SequenceNumber> {
        let txid = handle.id();
        let (mutations, keys) = {
            let mut txn = handle.lock_active()?;
            txn.state = TransactionState::Committing;
            (txn.mutations.clone(), txn.written_keys())
        };

        if mutations.is_empty() {
            self.finish_commit(handle);
            return Ok(self.committed_seq());
        }

        if let Some(lost) = keys
            .iter()
            .find(|k| !self.locks.holds(txid, &Resource::Key((*k).clone()), LockMode::Exclusive))
        {
            let mut txn = handle.lock();
            self.finish_abort(handle, &mut txn, "exclusive lock lost");
            return Err(CoreError::invalid_operation(format!(
                "{txid} lost its exclusive lock on {lost} before commit"
            )));
        }

        let gate = self.commit_gate.read();
        let records = mutations.into_iter().map(|m| LogRecord::Write {
            txid,
            key: m.key,
            old: m.before,
            new: m.after,
        });

        match self.wal.commit(txid, records) {
            Ok((lsn, bytes)) => {
                self.store.apply(txid, keys.iter());
                self.committed_seq.fetch_max(lsn.as_u64(), Ordering::SeqCst);
                drop(gate);
                self.stats.record_wal_bytes(bytes);
                self.finish_commit(handle);
                tracing::debug!(%txid, %lsn, writes = keys.len(), "transaction committed");
                self.maybe_checkpoint();
                Ok(lsn)
            }
            Err(err) => {
                drop(gate);
                self.stats.record_durability_failure();
                tracing::error!(%txid, error = %err, "commit not durable");
                let mut txn = handle.lock();
                self.finish_abort(handle, &mut txn, "commit flush failed");
                Err(CoreError::durability_failure(txid, err))
            }
        }
    }

    fn finish_commit(&self, handle: &TransactionHandle) {
        let txid = handle.id();
        let mut txn = handle.lock();
        txn.state = TransactionState::Committed;
        let resources = txn.resources();
        txn.locks.clear();
        txn.mutations.clear();
        drop(txn);
        self.locks.release_all(txid, resources.iter());
        self.active.write().remove(&txid);
        self.stats.record_transaction_commit();
    }

    /// Aborts the transaction, discarding its writes and releasing its locks.
    ///
    /// May be called from any thread holding a clone of the handle. A lock
    /// wait in progress on the owning thread ends with `TransactionClosed`.
    /// Fails once commit has started.
    pub fn abort(&self, handle: &TransactionHandle) -> CoreResult<()> {
        let mut txn = handle.lock();
        match txn.state {
            TransactionState::Active => {
                self.finish_abort(handle, &mut txn, "requested");
                Ok(())
            }
            TransactionState::Committing => Err(CoreError::invalid_operation(format!(
                "cannot abort {}: commit in progress",
                handle.id()
            ))),
            state => Err(CoreError::TransactionClosed {
                txid: handle.id(),
                state,
            }),
        }
    }

    fn abort_internal(&self, handle: &TransactionHandle, reason: &str) {
        let mut txn = handle.lock();
        if txn.state == TransactionState::Active {
            self.finish_abort(handle, &mut txn, reason);
        }
    }

    fn finish_abort(&self, handle: &TransactionHandle, txn: &mut Transaction, reason: &str) {
        let txid = handle.id();
        let committing = txn.state == TransactionState::Committing;
        let logged = !txn.mutations.is_empty() || committing;
        txn.state = TransactionState::Aborted;

        let keys = txn.written_keys();
        self.store.discard(txid, keys.iter());
        txn.mutations.clear();

        let resources = txn.resources();
        txn.locks.clear();
        handle.shared.cancelled.store(true, Ordering::Release);
        self.locks.release_all(txid, resources.iter());
        self.locks.wake_all();

        if logged {
            if let Err(err) = self.wal.append(LogRecord::Abort { txid }) {
                tracing::warn!(%txid, error = %err, "could not log abort");
            } else if committing {
                // A failed commit may have left its commit entry in the log;
                // the abort must reach storage before anything else does.
                if let Err(err) = self.wal.flush() {
                    tracing::warn!(%txid, error = %err, "could not flush abort of failed commit");
                }
            }
        }

        self.active.write().remove(&txid);
        self.stats.record_transaction_abort();
        tracing::debug!(%txid, reason, "transaction aborted");
    }

    /// Aborts every active transaction. Used on close.
    pub fn abort_all(&self) -> usize {
        let handles: Vec<_> = self.active.read().values().cloned().collect();
        let mut aborted = 0;
        for handle in handles {
            if self.abort(&handle).is_ok() {
                aborted += 1;
            }
        }
        aborted
    }

    fn maybe_checkpoint(&self) {
        let threshold = self.config.checkpoint_wal_size;
        if threshold == 0 {
            return;
        }
        let Some(_running) = self.checkpointing.try_lock() else {
            return;
        };
        match self.wal.size() {
            Ok(size) if size >= threshold => {
                if let Err(err) = self.checkpoint_locked() {
                    tracing::warn!(error = %err, "automatic checkpoint failed");
                }
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "could not size WAL"),
        }
    }

    /// Writes a snapshot of the committed state and truncates the WAL.
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        let _running = self.checkpointing.lock();
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> CoreResult<CheckpointReport> {
        if !self.is_recovered() {
            return Err(CoreError::RecoveryRequired);
        }
        let _gate = self.commit_gate.write();
        let snapshot = Snapshot {
            covered: self.committed_seq(),
            next_txid: TransactionId::new(self.next_txid.load(Ordering::SeqCst)),
            records: self.store.committed_snapshot(),
        };
        let snapshot_bytes = self.snapshots.write(&snapshot)?;

        // Commits append their whole segment under the gate, so the log holds
        // only finished transactions and everything in it is now covered.
        self.wal.clear()?;
        self.wal.mark_checkpoint(snapshot.covered)?;

        self.stats.record_checkpoint();
        let report = CheckpointReport {
            covered: snapshot.covered,
            records: snapshot.records.len(),
            snapshot_bytes,
        };
        tracing::info!(covered = %report.covered, records = report.records, "checkpoint complete");
        Ok(report)
    }

    /// Highest durable commit sequence.
    pub fn committed_seq(&self) -> SequenceNumber {
        SequenceNumber::new(self.committed_seq.load(Ordering::SeqCst))
    }

    /// Number of transactions not yet committed or aborted.
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// The constraint registry.
    pub fn constraints(&self) -> &ConstraintEngine {
        &self.constraints
    }

    /// The record store.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// The lock manager.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// The WAL.
    pub fn wal(&self) -> &WalManager {
        &self.wal
    }
}
