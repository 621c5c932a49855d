//! In-memory record table.
//!
//! Each key owns a slot holding its last committed value and at most one
//! staged (uncommitted) value. Staged values are only visible to their
//! owner, or to dirty readers. Exclusive key locks keep a second writer
//! from ever reaching `stage`; the conflict check there is a backstop.

use crate::error::{CoreError, CoreResult};
use crate::types::{Key, TransactionId};
use ledgerdb_codec::Value;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Slot {
    committed: Option<Value>,
    staged: Option<Staged>,
}

#[derive(Debug)]
struct Staged {
    owner: TransactionId,
    /// `None` stages a delete.
    value: Option<Value>,
}

impl Slot {
    fn is_vacant(&self) -> bool {
        self.committed.is_none() && self.staged.is_none()
    }

    fn visible(&self, txid: TransactionId, dirty: bool) -> Option<Value> {
        match &self.staged {
            Some(staged) if staged.owner == txid || dirty => staged.value.clone(),
            _ => self.committed.clone(),
        }
    }
}

/// The record table shared by all transactions.
///
/// The outer map lock is only held long enough to find or create a slot;
/// per-key work happens under the slot's own mutex. A slot left with
/// neither a committed nor a staged value is removed from the map.
#[derive(Debug, Default)]
pub struct RecordStore {
    slots: RwLock<BTreeMap<Key, Arc<Mutex<Slot>>>>,
}

impl RecordStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &Key) -> Option<Arc<Mutex<Slot>>> {
        self.slots.read().get(key).cloned()
    }

    fn slot_or_create(&self, key: &Key) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slot(key) {
            return slot;
        }
        Arc::clone(self.slots.write().entry(key.clone()).or_default())
    }

    /// Removes the slot of `key` if it is vacant and nobody else holds it.
    fn prune(&self, key: &Key) {
        let mut slots = self.slots.write();
        // New handles are only cloned under the map lock, so a count of one
        // means no caller is about to stage into this slot.
        let vacant = slots
            .get(key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.lock().is_vacant());
        if vacant {
            slots.remove(key);
        }
    }

    /// Returns the value of `key` as seen by `txid`.
    ///
    /// The owner sees its own staged value; with `dirty` set, any staged
    /// value is visible.
    pub fn read(&self, key: &Key, txid: TransactionId, dirty: bool) -> Option<Value> {
        self.slot(key)
            .and_then(|slot| slot.lock().visible(txid, dirty))
    }

    /// Returns the last committed value of `key`.
    pub fn committed(&self, key: &Key) -> Option<Value> {
        self.slot(key).and_then(|slot| slot.lock().committed.clone())
    }

    /// Stages `value` (or a delete, for `None`) for `txid`.
    ///
    /// Restaging a key the transaction already staged replaces the value.
    pub fn stage(&self, key: &Key, txid: TransactionId, value: Option<Value>) -> CoreResult<()> {
        let slot = self.slot_or_create(key);
        let mut slot = slot.lock();
        if let Some(staged) = &slot.staged {
            if staged.owner != txid {
                return Err(CoreError::Conflict {
                    key: key.clone(),
                    txid,
                    holder: staged.owner,
                });
            }
        }
        slot.staged = Some(Staged { owner: txid, value });
        Ok(())
    }

    /// Drops the staged value of `key` if `txid` owns it.
    pub fn unstage(&self, key: &Key, txid: TransactionId) {
        let Some(slot) = self.slot(key) else {
            return;
        };
        let vacant = {
            let mut slot = slot.lock();
            if slot.staged.as_ref().is_some_and(|s| s.owner == txid) {
                slot.staged = None;
            }
            slot.is_vacant()
        };
        drop(slot);
        if vacant {
            self.prune(key);
        }
    }

    /// Promotes every value `txid` staged on `keys` to committed.
    pub fn apply<'a>(&self, txid: TransactionId, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            let Some(slot) = self.slot(key) else {
                continue;
            };
            let vacant = {
                let mut slot = slot.lock();
                if slot.staged.as_ref().is_some_and(|s| s.owner == txid) {
                    if let Some(staged) = slot.staged.take() {
                        slot.committed = staged.value;
                    }
                }
                slot.is_vacant()
            };
            drop(slot);
            if vacant {
                self.prune(key);
            }
        }
    }

    /// Drops every value `txid` staged on `keys`.
    pub fn discard<'a>(&self, txid: TransactionId, keys: impl IntoIterator<Item = &'a Key>) {
        for key in keys {
            self.unstage(key, txid);
        }
    }

    /// Sets the committed value of `key` directly. Used by recovery replay.
    pub fn install(&self, key: &Key, value: Option<Value>) {
        let deleted = value.is_none();
        let slot = self.slot_or_create(key);
        slot.lock().committed = value;
        drop(slot);
        if deleted {
            self.prune(key);
        }
    }

    /// Replaces the whole table with `table`.
    pub fn load(&self, table: BTreeMap<Key, Value>) {
        let slots = table
            .into_iter()
            .map(|(key, value)| {
                let slot = Slot {
                    committed: Some(value),
                    staged: None,
                };
                (key, Arc::new(Mutex::new(slot)))
            })
            .collect();
        *self.slots.write() = slots;
    }

    /// Returns every committed record.
    pub fn committed_snapshot(&self) -> BTreeMap<Key, Value> {
        let slots = self.slots.read();
        slots
            .iter()
            .filter_map(|(key, slot)| {
                slot.lock()
                    .committed
                    .clone()
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    /// Returns the keys visible to `txid` that satisfy `filter`, in key order.
    pub fn keys_matching(
        &self,
        txid: TransactionId,
        dirty: bool,
        filter: impl Fn(&Key) -> bool,
    ) -> Vec<Key> {
        let slots = self.slots.read();
        slots
            .iter()
            .filter(|(key, _)| filter(key))
            .filter(|(_, slot)| slot.lock().visible(txid, dirty).is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Number of keys with a committed value.
    pub fn len(&self) -> usize {
        let slots = self.slots.read();
        slots
            .values()
            .filter(|slot| slot.lock().committed.is_some())
            .count()
    }

    /// Whether no key has a committed value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
