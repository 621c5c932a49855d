//! Built-in constraint rules.

use super::Constraint;
use ledgerdb_codec::Value;

fn integer_of(new: &Value) -> Result<i64, String> {
    new.as_i64()
        .ok_or_else(|| format!("expected an integer, got {}", new.type_name()))
}

/// Integer values must be zero or greater.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonNegative;

impl Constraint for NonNegative {
    fn name(&self) -> &str {
        "non_negative"
    }

    fn check(&self, _old: Option<&Value>, new: Option<&Value>) -> Result<(), String> {
        let Some(new) = new else { return Ok(()) };
        let n = integer_of(new)?;
        if n < 0 {
            return Err(format!("value {n} is below zero"));
        }
        Ok(())
    }
}

/// Integer values must fall in `min..=max`.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    /// Inclusive lower bound.
    pub min: i64,
    /// Inclusive upper bound.
    pub max: i64,
}

impl Range {
    /// Creates a range rule.
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }
}

impl Constraint for Range {
    fn name(&self) -> &str {
        "range"
    }

    fn check(&self, _old: Option<&Value>, new: Option<&Value>) -> Result<(), String> {
        let Some(new) = new else { return Ok(()) };
        let n = integer_of(new)?;
        if n < self.min || n > self.max {
            return Err(format!("value {n} outside {}..={}", self.min, self.max));
        }
        Ok(())
    }
}

/// Writes may not store `Null`. Deletes are allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotNull;

impl Constraint for NotNull {
    fn name(&self) -> &str {
        "not_null"
    }

    fn check(&self, _old: Option<&Value>, new: Option<&Value>) -> Result<(), String> {
        match new {
            Some(Value::Null) => Err("null is not allowed".to_owned()),
            _ => Ok(()),
        }
    }
}

/// A named closure over the old and new values.
pub struct Predicate<F> {
    name: String,
    check: F,
}

impl<F> Predicate<F>
where
    F: Fn(Option<&Value>, Option<&Value>) -> Result<(), String> + Send + Sync,
{
    /// Wraps `check` under `name`.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> Constraint for Predicate<F>
where
    F: Fn(Option<&Value>, Option<&Value>) -> Result<(), String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, old: Option<&Value>, new: Option<&Value>) -> Result<(), String> {
        (self.check)(old, new)
    }
}
