//! Fault injection for storage backends.
//!
//! [`FaultyBackend`] wraps any [`StorageBackend`] and fails operations
//! according to the [`FaultPlan`] currently installed in its [`FaultSwitch`].
//! The switch is shared, so a test keeps one handle and flips faults on while
//! the database owns the backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Which operations a [`FaultyBackend`] should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultPlan {
    /// Pass every operation through.
    #[default]
    Healthy,
    /// Every `append` fails without writing.
    FailAppend,
    /// Every `flush`/`sync` fails; appends still land.
    FailFlush,
    /// The next `append` writes only `valid_bytes` and fails, then the
    /// backend behaves as [`FaultPlan::PowerCut`].
    TornAppend {
        /// Bytes of the torn append that reach storage.
        valid_bytes: usize,
    },
    /// Every mutating operation fails. Reads still work.
    PowerCut,
    /// Every `truncate` fails; everything else passes through.
    FailTruncate,
    /// The next `flush` fails, then the backend behaves as
    /// [`FaultPlan::FailTruncate`].
    FlushGlitch,
}

/// Shared control handle for a [`FaultyBackend`].
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    plan: Arc<Mutex<FaultPlan>>,
    triggered: Arc<AtomicU64>,
}

impl FaultSwitch {
    /// Creates a switch in the healthy state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new plan.
    pub fn set(&self, plan: FaultPlan) {
        *self.plan.lock() = plan;
    }

    /// Restores healthy behaviour.
    pub fn heal(&self) {
        self.set(FaultPlan::Healthy);
    }

    /// Returns the current plan.
    #[must_use]
    pub fn plan(&self) -> FaultPlan {
        *self.plan.lock()
    }

    /// Number of operations failed so far.
    #[must_use]
    pub fn triggered(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    fn trip(&self, what: &'static str) -> StorageError {
        self.triggered.fetch_add(1, Ordering::Relaxed);
        debug!(fault = what, "injected storage fault");
        StorageError::Injected(what)
    }
}

/// A backend wrapper that injects faults.
#[derive(Debug)]
pub struct FaultyBackend<B> {
    inner: B,
    switch: FaultSwitch,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`, returning the backend and its control switch.
    pub fn new(inner: B) -> (Self, FaultSwitch) {
        let switch = FaultSwitch::new();
        (
            Self {
                inner,
                switch: switch.clone(),
            },
            switch,
        )
    }

    /// Returns the wrapped backend.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        match self.switch.plan() {
            FaultPlan::Healthy
            | FaultPlan::FailFlush
            | FaultPlan::FailTruncate
            | FaultPlan::FlushGlitch => self.inner.append(data),
            FaultPlan::FailAppend => Err(self.switch.trip("append failed")),
            FaultPlan::PowerCut => Err(self.switch.trip("power cut")),
            FaultPlan::TornAppend { valid_bytes } => {
                let keep = valid_bytes.min(data.len());
                self.inner.append(&data[..keep])?;
                // the torn prefix reaches the medium before power is lost
                self.inner.flush()?;
                self.switch.set(FaultPlan::PowerCut);
                Err(self.switch.trip("torn append"))
            }
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        match self.switch.plan() {
            FaultPlan::Healthy | FaultPlan::FailAppend | FaultPlan::FailTruncate => {
                self.inner.flush()
            }
            FaultPlan::FailFlush => Err(self.switch.trip("flush failed")),
            FaultPlan::FlushGlitch => {
                self.switch.set(FaultPlan::FailTruncate);
                Err(self.switch.trip("flush glitch"))
            }
            FaultPlan::TornAppend { .. } | FaultPlan::PowerCut => {
                Err(self.switch.trip("power cut"))
            }
        }
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        match self.switch.plan() {
            FaultPlan::Healthy | FaultPlan::FailAppend | FaultPlan::FailTruncate => {
                self.inner.sync()
            }
            FaultPlan::FailFlush => Err(self.switch.trip("sync failed")),
            FaultPlan::FlushGlitch => {
                self.switch.set(FaultPlan::FailTruncate);
                Err(self.switch.trip("sync glitch"))
            }
            FaultPlan::TornAppend { .. } | FaultPlan::PowerCut => {
                Err(self.switch.trip("power cut"))
            }
        }
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        match self.switch.plan() {
            FaultPlan::PowerCut | FaultPlan::TornAppend { .. } => {
                Err(self.switch.trip("power cut"))
            }
            FaultPlan::FailTruncate => Err(self.switch.trip("truncate failed")),
            _ => self.inner.truncate(new_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryBackend;

    #[test]
    fn healthy_passes_through() {
        let (mut backend, switch) = FaultyBackend::new(MemoryBackend::new());
        backend.append(b"ok").unwrap();
        backend.flush().unwrap();
        assert_eq!(switch.triggered(), 0);
        assert_eq!(backend.read_all().unwrap(), b"ok");
    }

    #[test]
    fn fail_flush_keeps_appended_bytes_volatile() {
        let memory = MemoryBackend::new();
        let (mut backend, switch) = FaultyBackend::new(memory.clone());
        switch.set(FaultPlan::FailFlush);

        backend.append(b"pending").unwrap();
        assert!(backend.flush().is_err());
        assert_eq!(memory.durable_len(), 0);
        assert_eq!(switch.triggered(), 1);
    }

    #[test]
    fn flush_glitch_fails_once_then_blocks_truncate() {
        let memory = MemoryBackend::new();
        let (mut backend, switch) = FaultyBackend::new(memory.clone());
        switch.set(FaultPlan::FlushGlitch);

        backend.append(b"abc").unwrap();
        assert!(backend.flush().is_err());
        assert_eq!(switch.plan(), FaultPlan::FailTruncate);
        assert!(backend.truncate(0).is_err());

        backend.flush().unwrap();
        assert_eq!(memory.durable_len(), 3);
        assert_eq!(switch.triggered(), 2);
    }

    #[test]
    fn torn_append_writes_prefix_then_cuts_power() {
        let memory = MemoryBackend::new();
        let (mut backend, switch) = FaultyBackend::new(memory.clone());
        switch.set(FaultPlan::TornAppend { valid_bytes: 3 });

        assert!(backend.append(b"abcdef").is_err());
        assert_eq!(memory.crash_image().read_all().unwrap(), b"abc");
        assert_eq!(switch.plan(), FaultPlan::PowerCut);
        assert!(backend.append(b"more").is_err());

        switch.heal();
        backend.append(b"!").unwrap();
        assert_eq!(backend.read_all().unwrap(), b"abc!");
    }
}
