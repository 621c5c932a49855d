//! Lock manager.
//!
//! Locks are taken on [`Resource`]s: individual keys, plus one store-wide
//! predicate resource used to keep serializable readers and writers apart.
//! Waiting requests publish edges in a [`WaitForGraph`]; a request that
//! closes a cycle picks the most recently started transaction in it as the
//! victim.
//!
//! | held \ requested | Shared | Exclusive | IntentExclusive |
//! |------------------|--------|-----------|-----------------|
//! | Shared           | yes    | no        | no              |
//! | Exclusive        | no     | no        | no              |
//! | IntentExclusive  | no     | no        | yes             |
//!
//! Modes held by the requesting transaction itself never conflict.

mod graph;
mod manager;

pub use graph::WaitForGraph;
pub use manager::LockManager;

use crate::types::Key;
use std::fmt;

/// Something a transaction can lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A single record key.
    Key(Key),
    /// The whole key space, as seen by scans and serializable reads.
    Predicate,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key '{key}'"),
            Self::Predicate => f.write_str("<predicate>"),
        }
    }
}

/// Lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Read access; compatible with other readers.
    Shared,
    /// Write access; compatible with nothing.
    Exclusive,
    /// Announces writes below the resource; compatible only with itself.
    IntentExclusive,
}

impl LockMode {
    const fn bit(self) -> u8 {
        match self {
            Self::Shared => 0b001,
            Self::Exclusive => 0b010,
            Self::IntentExclusive => 0b100,
        }
    }

    /// Whether a holder of `self` lets another transaction take `other`.
    #[must_use]
    pub const fn compatible_with(self, other: LockMode) -> bool {
        matches!(
            (self, other),
            (Self::Shared, Self::Shared) | (Self::IntentExclusive, Self::IntentExclusive)
        )
    }
}

/// The set of modes one transaction holds on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeSet(u8);

impl ModeSet {
    /// Whether no mode is held.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `mode` is in the set.
    #[must_use]
    pub const fn contains(self, mode: LockMode) -> bool {
        self.0 & mode.bit() != 0
    }

    /// Whether holding this set already grants `mode`.
    #[must_use]
    pub const fn covers(self, mode: LockMode) -> bool {
        self.contains(mode) || self.contains(LockMode::Exclusive)
    }

    /// Whether another transaction holding this set blocks `mode`.
    #[must_use]
    pub fn blocks(self, mode: LockMode) -> bool {
        [
            LockMode::Shared,
            LockMode::Exclusive,
            LockMode::IntentExclusive,
        ]
        .into_iter()
        .any(|held| self.contains(held) && !held.compatible_with(mode))
    }

    pub(crate) fn insert(&mut self, mode: LockMode) {
        self.0 |= mode.bit();
    }

    pub(crate) fn remove(&mut self, mode: LockMode) {
        self.0 &= !mode.bit();
    }
}

/// Outcome of a successful lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The mode was newly granted.
    Granted,
    /// The transaction already held a covering mode.
    AlreadyHeld,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_matrix() {
        use LockMode::*;
        assert!(Shared.compatible_with(Shared));
        assert!(!Shared.compatible_with(Exclusive));
        assert!(!Shared.compatible_with(IntentExclusive));
        assert!(!Exclusive.compatible_with(Shared));
        assert!(!Exclusive.compatible_with(Exclusive));
        assert!(IntentExclusive.compatible_with(IntentExclusive));
        assert!(!IntentExclusive.compatible_with(Shared));
    }

    #[test]
    fn mode_set_cover_and_block() {
        let mut set = ModeSet::default();
        assert!(set.is_empty());
        assert!(!set.blocks(LockMode::Exclusive));

        set.insert(LockMode::Shared);
        assert!(set.covers(LockMode::Shared));
        assert!(!set.covers(LockMode::Exclusive));
        assert!(set.blocks(LockMode::Exclusive));
        assert!(!set.blocks(LockMode::Shared));

        set.insert(LockMode::Exclusive);
        assert!(set.covers(LockMode::Shared));
        assert!(set.blocks(LockMode::Shared));

        set.remove(LockMode::Exclusive);
        assert_eq!(set, {
            let mut s = ModeSet::default();
            s.insert(LockMode::Shared);
            s
        });
    }
}
