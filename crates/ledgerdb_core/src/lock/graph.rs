//! Wait-for graph used for deadlock detection.

use super::{LockMode, Resource};
use crate::types::TransactionId;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct Wait {
    resource: Resource,
    mode: LockMode,
    targets: HashSet<TransactionId>,
}

/// Directed graph with an edge `a -> b` while `a` waits on a lock `b` holds.
///
/// Each waiter republishes its full edge set every time it re-checks its
/// request. Releases refresh the edges of everyone waiting on the released
/// resource, so a holder that let go is never part of a reported cycle.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    waits: HashMap<TransactionId, Wait>,
    victims: HashSet<TransactionId>,
}

impl WaitForGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `waiter` wants `mode` on `resource` and is blocked by
    /// `holders`, then looks for a cycle through it.
    ///
    /// Returns the members of the cycle, starting with `waiter`.
    pub fn wait(
        &mut self,
        waiter: TransactionId,
        resource: &Resource,
        mode: LockMode,
        holders: impl IntoIterator<Item = TransactionId>,
    ) -> Option<Vec<TransactionId>> {
        let targets: HashSet<_> = holders.into_iter().filter(|h| *h != waiter).collect();
        if targets.is_empty() {
            self.waits.remove(&waiter);
            return None;
        }
        self.waits.insert(
            waiter,
            Wait {
                resource: resource.clone(),
                mode,
                targets,
            },
        );
        self.cycle_through(waiter)
    }

    /// Recomputes the edges of every request waiting on `resource`.
    ///
    /// `blockers` returns who currently blocks a waiter's mode. Waiters left
    /// with no blocker drop out until they re-check.
    pub fn refresh<F>(&mut self, resource: &Resource, blockers: F)
    where
        F: Fn(TransactionId, LockMode) -> Vec<TransactionId>,
    {
        self.waits.retain(|waiter, wait| {
            if &wait.resource != resource {
                return true;
            }
            wait.targets = blockers(*waiter, wait.mode)
                .into_iter()
                .filter(|h| h != waiter)
                .collect();
            !wait.targets.is_empty()
        });
    }

    /// Removes every out-edge of `txid` and any pending victim mark.
    pub fn clear(&mut self, txid: TransactionId) {
        self.waits.remove(&txid);
        self.victims.remove(&txid);
    }

    /// Whether `txid` is currently waiting.
    pub fn is_waiting(&self, txid: TransactionId) -> bool {
        self.waits.contains_key(&txid)
    }

    /// Marks a waiting transaction as a deadlock victim.
    pub fn mark_victim(&mut self, txid: TransactionId) {
        self.victims.insert(txid);
    }

    /// Consumes a victim mark left for `txid`.
    pub fn take_victim(&mut self, txid: TransactionId) -> bool {
        self.victims.remove(&txid)
    }

    /// Number of waiting transactions.
    pub fn waiters(&self) -> usize {
        self.waits.len()
    }

    fn cycle_through(&self, start: TransactionId) -> Option<Vec<TransactionId>> {
        // Iterative DFS keeping the current path; a back edge to `start` is a cycle.
        let mut path = vec![start];
        let mut stack: Vec<Vec<TransactionId>> = vec![self.successors(start)];
        let mut seen = HashSet::from([start]);

        while let Some(frontier) = stack.last_mut() {
            let Some(next) = frontier.pop() else {
                stack.pop();
                path.pop();
                continue;
            };
            if next == start {
                return Some(path);
            }
            if seen.insert(next) {
                path.push(next);
                stack.push(self.successors(next));
            }
        }
        None
    }

    fn successors(&self, txid: TransactionId) -> Vec<TransactionId> {
        self.waits
            .get(&txid)
            .map(|wait| wait.targets.iter().copied().collect())
            .unwrap_or_default()
    }
}
