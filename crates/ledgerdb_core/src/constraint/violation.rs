//! Constraint violation type.

use crate::types::Key;
use std::fmt;

/// A write rejected by a constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Name of the rule that failed.
    pub rule: String,
    /// Key being written.
    pub key: Key,
    /// Rule-supplied explanation.
    pub reason: String,
}

impl Violation {
    /// Creates a violation.
    pub fn new(rule: impl Into<String>, key: Key, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            key,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}: {}", self.rule, self.key, self.reason)
    }
}
