//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How long a lock request may wait before failing with a timeout.
    ///
    /// `Duration::ZERO` disables waiting: a conflicting request fails
    /// immediately with `WouldBlock`.
    pub lock_timeout: Duration,

    /// Whether to sync the WAL on every commit.
    ///
    /// Turning this off acknowledges commits before they reach stable
    /// storage; a crash can then lose recently acknowledged commits.
    pub sync_on_commit: bool,

    /// Buffered (non-commit) WAL bytes that force a write-out.
    pub wal_buffer_limit: usize,

    /// WAL size that triggers an automatic checkpoint after commit (0 = never).
    pub checkpoint_wal_size: u64,

    /// Number of lock table shards.
    pub lock_shards: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            lock_timeout: Duration::from_secs(5),
            sync_on_commit: true,
            wal_buffer_limit: 64 * 1024,             // 64 KB
            checkpoint_wal_size: 16 * 1024 * 1024,   // 16 MB
            lock_shards: 16,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets whether to sync WAL on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the WAL buffer limit in bytes.
    #[must_use]
    pub const fn wal_buffer_limit(mut self, bytes: usize) -> Self {
        self.wal_buffer_limit = bytes;
        self
    }

    /// Sets the WAL size that triggers an automatic checkpoint.
    #[must_use]
    pub const fn checkpoint_wal_size(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_size = bytes;
        self
    }

    /// Sets the number of lock table shards (at least one).
    #[must_use]
    pub const fn lock_shards(mut self, shards: usize) -> Self {
        self.lock_shards = if shards == 0 { 1 } else { shards };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.lock_shards, 16);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .lock_timeout(Duration::ZERO)
            .checkpoint_wal_size(1024)
            .lock_shards(0);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert!(config.lock_timeout.is_zero());
        assert_eq!(config.checkpoint_wal_size, 1024);
        assert_eq!(config.lock_shards, 1);
    }
}
