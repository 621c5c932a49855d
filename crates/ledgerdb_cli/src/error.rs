//! CLI errors.

use ledgerdb_core::CoreError;
use ledgerdb_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// A command needs `--path`.
    #[error("database path required for {0}")]
    MissingPath(&'static str),

    /// Neither a WAL nor a snapshot file exists at the path.
    #[error("no database found at {}", .0.display())]
    NotADatabase(PathBuf),

    /// Verification found problems.
    #[error("verification failed: {0} problem(s)")]
    VerificationFailed(usize),

    /// Error from the core engine.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Error reading a file.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Error producing JSON output.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;
