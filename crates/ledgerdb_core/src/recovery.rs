//! Crash recovery: deciding what the log's transactions amount to.
//!
//! Entries are grouped by transaction. A transaction counts as committed
//! when its last outcome entry is a commit; an abort written after a commit
//! marks a commit whose flush was reported as failed. Committed
//! transactions are replayed in commit order, skipping those the snapshot
//! already covers. Transactions with no outcome were in flight at the crash
//! and are discarded.

use crate::store::RecordStore;
use crate::types::{Key, SequenceNumber, TransactionId};
use crate::wal::{LogEntry, LogRecord};
use ledgerdb_codec::Value;
use std::collections::BTreeMap;

/// Summary of a recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Commit sequence covered by the snapshot that was loaded.
    pub snapshot_seq: SequenceNumber,
    /// Records loaded from the snapshot.
    pub snapshot_records: usize,
    /// Intact WAL entries read.
    pub wal_entries: usize,
    /// Committed transactions replayed from the WAL.
    pub replayed_transactions: usize,
    /// Aborted or unfinished transactions dropped.
    pub discarded_transactions: usize,
    /// Bytes of torn WAL tail cut off.
    pub truncated_bytes: u64,
    /// First transaction id handed out after recovery.
    pub next_txid: TransactionId,
    /// Highest commit sequence after recovery.
    pub last_commit: SequenceNumber,
    /// Committed records after recovery.
    pub records: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    InFlight,
    Committed(SequenceNumber),
    Aborted,
}

#[derive(Debug)]
struct TxnLog {
    writes: Vec<(Key, Option<Value>)>,
    outcome: Outcome,
}

/// What replaying a log would do.
#[derive(Debug)]
pub struct RecoveryPlan {
    /// Committed transactions after the snapshot, in commit order.
    replay: Vec<(SequenceNumber, TransactionId, Vec<(Key, Option<Value>)>)>,
    covered: usize,
    aborted: usize,
    in_flight: usize,
    max_txid: Option<TransactionId>,
    max_lsn: SequenceNumber,
    checkpoint: Option<SequenceNumber>,
}

impl RecoveryPlan {
    /// Builds a plan from the log entries; commits at or below `covered`
    /// are already in the snapshot.
    pub fn build(entries: &[(u64, LogEntry)], covered: SequenceNumber) -> Self {
        let mut txns: BTreeMap<TransactionId, TxnLog> = BTreeMap::new();
        let mut max_lsn = SequenceNumber::default();
        let mut checkpoint = None;

        for (_, entry) in entries {
            max_lsn = max_lsn.max(entry.lsn);
            if let LogRecord::Checkpoint { covered } = entry.record {
                checkpoint = Some(covered);
                continue;
            }
            let Some(txid) = entry.record.txid() else {
                continue;
            };
            let log = txns.entry(txid).or_insert_with(|| TxnLog {
                writes: Vec::new(),
                outcome: Outcome::InFlight,
            });
            match &entry.record {
                LogRecord::Write { key, new, .. } => log.writes.push((key.clone(), new.clone())),
                LogRecord::Commit { .. } => log.outcome = Outcome::Committed(entry.lsn),
                LogRecord::Abort { .. } => log.outcome = Outcome::Aborted,
                LogRecord::Checkpoint { .. } => {}
            }
        }

        let max_txid = txns.keys().next_back().copied();
        let mut plan = Self {
            replay: Vec::new(),
            covered: 0,
            aborted: 0,
            in_flight: 0,
            max_txid,
            max_lsn,
            checkpoint,
        };

        for (txid, log) in txns {
            match log.outcome {
                Outcome::Committed(lsn) if lsn <= covered => plan.covered += 1,
                Outcome::Committed(lsn) => plan.replay.push((lsn, txid, log.writes)),
                Outcome::Aborted => plan.aborted += 1,
                Outcome::InFlight => plan.in_flight += 1,
            }
        }
        plan.replay.sort_by_key(|(lsn, _, _)| *lsn);
        plan
    }

    /// Installs every replayable write into `store`. Returns the number of
    /// transactions replayed.
    pub fn apply(&self, store: &RecordStore) -> usize {
        for (lsn, txid, writes) in &self.replay {
            tracing::trace!(%txid, %lsn, writes = writes.len(), "replaying commit");
            for (key, value) in writes {
                store.install(key, value.clone());
            }
        }
        self.replay.len()
    }

    /// Transactions dropped as aborted or unfinished.
    pub fn discarded(&self) -> usize {
        self.aborted + self.in_flight
    }

    /// Committed transactions already covered by the snapshot.
    pub fn already_covered(&self) -> usize {
        self.covered
    }

    /// Transactions that will be replayed.
    pub fn replay_count(&self) -> usize {
        self.replay.len()
    }

    /// Highest transaction id in the log.
    pub fn max_txid(&self) -> Option<TransactionId> {
        self.max_txid
    }

    /// Highest sequence number in the log.
    pub fn max_lsn(&self) -> SequenceNumber {
        self.max_lsn
    }

    /// Sequence number of the last replayed commit.
    pub fn last_commit(&self) -> SequenceNumber {
        self.replay
            .last()
            .map_or_else(SequenceNumber::default, |(lsn, _, _)| *lsn)
    }

    /// Covered sequence named by the last checkpoint marker, if any.
    pub fn checkpoint_marker(&self) -> Option<SequenceNumber> {
        self.checkpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LogBuilder {
        entries: Vec<(u64, LogEntry)>,
    }

    impl LogBuilder {
        fn new() -> Self {
            Self {
                entries: Vec::new(),
            }
        }

        fn push(mut self, record: LogRecord) -> Self {
            let lsn = SequenceNumber::new(self.entries.len() as u64 + 1);
            self.entries.push((0, LogEntry::new(lsn, record)));
            self
        }

        fn write(self, txid: u64, key: &str, value: i64) -> Self {
            self.push(LogRecord::Write {
                txid: TransactionId::new(txid),
                key: Key::from(key),
                old: None,
                new: Some(Value::Integer(value)),
            })
        }

        fn commit(self, txid: u64) -> Self {
            self.push(LogRecord::Commit {
                txid: TransactionId::new(txid),
            })
        }

        fn abort(self, txid: u64) -> Self {
            self.push(LogRecord::Abort {
                txid: TransactionId::new(txid),
            })
        }
    }

    #[test]
    fn replays_committed_in_commit_order() {
        let log = LogBuilder::new()
            .write(1, "a", 1)
            .commit(1)
            .write(2, "a", 2)
            .commit(2);
        let plan = RecoveryPlan::build(&log.entries, SequenceNumber::default());
        let store = RecordStore::new();

        assert_eq!(plan.apply(&store), 2);
        assert_eq!(store.committed(&Key::from("a")), Some(Value::Integer(2)));
        assert_eq!(plan.last_commit(), SequenceNumber::new(4));
        assert_eq!(plan.max_txid(), Some(TransactionId::new(2)));
    }

    #[test]
    fn discards_aborted_and_unfinished() {
        let log = LogBuilder::new()
            .write(1, "a", 1)
            .abort(1)
            .write(2, "b", 2);
        let plan = RecoveryPlan::build(&log.entries, SequenceNumber::default());
        let store = RecordStore::new();

        assert_eq!(plan.apply(&store), 0);
        assert_eq!(plan.discarded(), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn abort_after_commit_cancels_commit() {
        let log = LogBuilder::new().write(1, "a", 1).commit(1).abort(1);
        let plan = RecoveryPlan::build(&log.entries, SequenceNumber::default());
        assert_eq!(plan.replay_count(), 0);
        assert_eq!(plan.discarded(), 1);
    }

    #[test]
    fn skips_commits_covered_by_snapshot() {
        let log = LogBuilder::new()
            .write(1, "a", 1)
            .commit(1)
            .write(2, "b", 2)
            .commit(2);
        let plan = RecoveryPlan::build(&log.entries, SequenceNumber::new(2));
        assert_eq!(plan.already_covered(), 1);
        assert_eq!(plan.replay_count(), 1);
    }

    #[test]
    fn remembers_checkpoint_marker() {
        let log = LogBuilder::new().push(LogRecord::Checkpoint {
            covered: SequenceNumber::new(7),
        });
        let plan = RecoveryPlan::build(&log.entries, SequenceNumber::new(7));
        assert_eq!(plan.checkpoint_marker(), Some(SequenceNumber::new(7)));
        assert_eq!(plan.max_lsn(), SequenceNumber::new(1));
    }
}
