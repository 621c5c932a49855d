//! Sharded lock table with blocking waits.

use super::{Acquired, LockMode, ModeSet, Resource, WaitForGraph};
use crate::error::{CoreError, CoreResult};
use crate::stats::DatabaseStats;
use crate::transaction::TransactionState;
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockEntry {
    holders: HashMap<TransactionId, ModeSet>,
}

impl LockEntry {
    fn blockers(&self, txid: TransactionId, mode: LockMode) -> Vec<TransactionId> {
        self.holders
            .iter()
            .filter(|(holder, held)| **holder != txid && held.blocks(mode))
            .map(|(holder, _)| *holder)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Shard {
    table: Mutex<HashMap<Resource, LockEntry>>,
    cond: Condvar,
}

/// Grants, releases and waits for locks.
///
/// The table is split into shards by resource hash; each shard has its own
/// mutex and condition variable, so unrelated keys never contend. The
/// wait-for graph sits behind its own mutex and is only touched by waiting
/// requests.
pub struct LockManager {
    shards: Vec<Shard>,
    graph: Mutex<WaitForGraph>,
    stats: Arc<DatabaseStats>,
}

impl LockManager {
    /// Creates a lock manager with `shards` table shards.
    pub fn new(shards: usize, stats: Arc<DatabaseStats>) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::default()).collect(),
            graph: Mutex::new(WaitForGraph::new()),
            stats,
        }
    }

    fn shard(&self, resource: &Resource) -> &Shard {
        let mut hasher = DefaultHasher::new();
        resource.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    /// Requests `mode` on `resource` for `txid`.
    ///
    /// Waits up to `timeout` for conflicting holders to release; a zero
    /// timeout fails at once with `WouldBlock`. While waiting, a cycle in
    /// the wait-for graph makes the newest transaction in it fail with
    /// `Deadlock`. Setting `cancelled` and calling [`LockManager::wake_all`]
    /// makes a waiting request give up with `TransactionClosed`.
    pub fn acquire(
        &self,
        txid: TransactionId,
        resource: &Resource,
        mode: LockMode,
        timeout: Duration,
        cancelled: &AtomicBool,
    ) -> CoreResult<Acquired> {
        let shard = self.shard(resource);
        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let mut table = shard.table.lock();
        let mut waited = false;

        loop {
            if cancelled.load(Ordering::Acquire) {
                self.graph.lock().clear(txid);
                return Err(CoreError::TransactionClosed {
                    txid,
                    state: TransactionState::Aborted,
                });
            }
            if waited && self.graph.lock().take_victim(txid) {
                self.graph.lock().clear(txid);
                return Err(CoreError::Deadlock { txid });
            }

            let entry = table.entry(resource.clone()).or_default();
            let held = entry.holders.get(&txid).copied().unwrap_or_default();
            if held.covers(mode) {
                if waited {
                    self.graph.lock().clear(txid);
                }
                return Ok(Acquired::AlreadyHeld);
            }

            let blockers = entry.blockers(txid, mode);
            if blockers.is_empty() {
                entry.holders.entry(txid).or_default().insert(mode);
                if waited {
                    self.graph.lock().clear(txid);
                }
                tracing::trace!(%txid, %resource, ?mode, "lock granted");
                return Ok(Acquired::Granted);
            }

            if timeout.is_zero() {
                return Err(CoreError::WouldBlock {
                    resource: resource.to_string(),
                    txid,
                });
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.graph.lock().clear(txid);
                return Err(CoreError::LockTimeout {
                    resource: resource.to_string(),
                    txid,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            let mut wake_victim = false;
            {
                let mut graph = self.graph.lock();
                if let Some(cycle) = graph.wait(txid, resource, mode, blockers) {
                    let victim = cycle.iter().copied().max().unwrap_or(txid);
                    tracing::debug!(%txid, %victim, ?cycle, "deadlock detected");
                    if victim == txid {
                        graph.clear(txid);
                        return Err(CoreError::Deadlock { txid });
                    }
                    graph.mark_victim(victim);
                    wake_victim = true;
                }
            }
            if wake_victim {
                // The victim may sleep on any shard; never hold ours while locking others.
                MutexGuard::unlocked(&mut table, || self.wake_all());
                waited = true;
                continue;
            }

            if !waited {
                self.stats.record_lock_wait();
                waited = true;
            }
            match deadline {
                Some(deadline) => {
                    shard.cond.wait_until(&mut table, deadline);
                }
                None => shard.cond.wait(&mut table),
            }
        }
    }

    /// Drops every mode `txid` holds on `resource`.
    pub fn release(&self, txid: TransactionId, resource: &Resource) {
        self.update(resource, |entry| {
            entry.holders.remove(&txid);
        });
    }

    /// Drops a single mode, keeping any other modes `txid` holds on `resource`.
    ///
    /// Releasing `Exclusive` after an upgrade leaves the original `Shared`.
    pub fn release_mode(&self, txid: TransactionId, resource: &Resource, mode: LockMode) {
        self.update(resource, |entry| {
            if let Some(held) = entry.holders.get_mut(&txid) {
                held.remove(mode);
                if held.is_empty() {
                    entry.holders.remove(&txid);
                }
            }
        });
    }

    /// Releases every listed resource for `txid` and forgets its waits.
    pub fn release_all<'a>(
        &self,
        txid: TransactionId,
        resources: impl IntoIterator<Item = &'a Resource>,
    ) {
        for resource in resources {
            self.release(txid, resource);
        }
        self.graph.lock().clear(txid);
    }

    fn update(&self, resource: &Resource, f: impl FnOnce(&mut LockEntry)) {
        let shard = self.shard(resource);
        let mut table = shard.table.lock();
        if let Some(entry) = table.get_mut(resource) {
            f(entry);
            self.graph
                .lock()
                .refresh(resource, |waiter, mode| entry.blockers(waiter, mode));
            if entry.holders.is_empty() {
                table.remove(resource);
            }
            shard.cond.notify_all();
        }
    }

    /// Whether `txid` holds a mode covering `mode` on `resource`.
    pub fn holds(&self, txid: TransactionId, resource: &Resource, mode: LockMode) -> bool {
        self.shard(resource)
            .table
            .lock()
            .get(resource)
            .and_then(|entry| entry.holders.get(&txid))
            .is_some_and(|held| held.covers(mode))
    }

    /// Number of transactions holding any mode on `resource`.
    pub fn holder_count(&self, resource: &Resource) -> usize {
        self.shard(resource)
            .table
            .lock()
            .get(resource)
            .map_or(0, |entry| entry.holders.len())
    }

    /// Wakes every waiting request so it re-checks cancellation and victim marks.
    pub fn wake_all(&self) {
        for shard in &self.shards {
            let _table = shard.table.lock();
            shard.cond.notify_all();
        }
    }

    /// Number of requests currently waiting.
    pub fn waiting(&self) -> usize {
        self.graph.lock().waiters()
    }
}
