//! Declarative constraints checked on every write.
//!
//! Rules are registered against a [`RecordClass`]. A write is checked
//! against every rule whose class matches the key, in registration order,
//! before it may enter the transaction's pending writes. A failed check
//! rejects just that write; the transaction stays active.

mod rules;
mod violation;

pub use rules::{NonNegative, NotNull, Predicate, Range};
pub use violation::Violation;

use crate::types::Key;
use ledgerdb_codec::Value;
use parking_lot::RwLock;
use std::sync::Arc;

/// Which keys a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordClass {
    /// Every key.
    All,
    /// Keys whose class (text before the first `:`) equals the prefix.
    Prefix(String),
    /// One key.
    Exact(Key),
}

impl RecordClass {
    /// Creates a class matching keys `"{class}:..."`.
    pub fn prefix(class: impl Into<String>) -> Self {
        Self::Prefix(class.into())
    }

    /// Whether `key` belongs to this class.
    #[must_use]
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(class) => key.class() == Some(class.as_str()),
            Self::Exact(exact) => exact == key,
        }
    }
}

/// A check over a key's value before and after a write.
///
/// `None` means absent: `old` is `None` on insert, `new` is `None` on delete.
pub trait Constraint: Send + Sync {
    /// Rule name, reported in violations.
    fn name(&self) -> &str;

    /// Returns `Err(reason)` to reject the write.
    fn check(&self, old: Option<&Value>, new: Option<&Value>) -> Result<(), String>;
}

/// Registry of constraints.
#[derive(Default)]
pub struct ConstraintEngine {
    rules: RwLock<Vec<(RecordClass, Arc<dyn Constraint>)>>,
}

impl ConstraintEngine {
    /// Creates an engine with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `rule` for keys in `class`.
    pub fn register(&self, class: RecordClass, rule: impl Constraint + 'static) {
        tracing::debug!(rule = rule.name(), ?class, "constraint registered");
        self.rules.write().push((class, Arc::new(rule)));
    }

    /// Registers a closure rule for keys in `class`.
    pub fn register_fn<F>(&self, class: RecordClass, name: impl Into<String>, check: F)
    where
        F: Fn(Option<&Value>, Option<&Value>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(class, Predicate::new(name, check));
    }

    /// Checks a proposed write to `key`. The first failing rule wins.
    pub fn validate(
        &self,
        key: &Key,
        old: Option<&Value>,
        new: Option<&Value>,
    ) -> Result<(), Violation> {
        let rules = self.rules.read();
        for (class, rule) in rules.iter().filter(|(class, _)| class.matches(key)) {
            if let Err(reason) = rule.check(old, new) {
                tracing::debug!(%key, rule = rule.name(), ?class, %reason, "write rejected");
                return Err(Violation::new(rule.name(), key.clone(), reason));
            }
        }
        Ok(())
    }

    /// Number of registered rules.
    pub fn rule_count(&self) -> usize {
        self.rules.read().len()
    }
}
