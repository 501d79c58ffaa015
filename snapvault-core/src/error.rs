//! Error types for snapvault operations.
//!
//! Only *fatal* conditions live here: usage/configuration problems, index
//! corruption, snapshot lifecycle violations, and broken invariants. Per-file
//! I/O failures during a backup or maintenance run are counted, logged, and
//! skipped — they never surface as a [`VaultError`].

use std::path::PathBuf;

use thiserror::Error;

/// All fatal error conditions a snapvault command can produce.
#[derive(Error, Debug)]
pub enum VaultError {
    /// Invalid or missing configuration (sources file parse errors, bad
    /// source paths, overlapping sources, etc.).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A filesystem operation outside the per-file error envelope failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The snapshot index reported an error (schema violation, constraint
    /// violation, corrupt store).
    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    /// A directory was expected to be a snapshot but is not one.
    #[error("Snapshot invalid: {}: {reason}", .path.display())]
    SnapshotInvalid { path: PathBuf, reason: String },

    /// The snapshot carries an IN_PROGRESS marker from an unfinished run.
    #[error("Snapshot is unfinished, delete the IN_PROGRESS marker or the whole snapshot: {}", .path.display())]
    SnapshotInProgress { path: PathBuf },

    /// Snapshot creation was requested but the directory already exists.
    #[error("Snapshot directory already exists: {}", .path.display())]
    SnapshotExists { path: PathBuf },

    /// A snapshot path could not be detached from a repository.
    #[error("Snapshot not attached to repository: {}", .path.display())]
    SnapshotNotAttached { path: PathBuf },

    /// Snapshots from different repositories were mixed in one invocation.
    #[error("Snapshots from different repositories mixed: {} and {}", .first.display(), .second.display())]
    MixedRepositories { first: PathBuf, second: PathBuf },

    /// The same snapshot was given twice, or attached twice.
    #[error("A snapshot path is equal to another: {}", .path.display())]
    DuplicateSnapshot { path: PathBuf },

    /// The repository path exists but is not a directory.
    #[error("Repository path is not a directory: {}", .path.display())]
    RepositoryInvalid { path: PathBuf },

    /// All 99 collision suffixes for an encoded target path are taken.
    #[error("Cannot create target path for source: {}", .path.display())]
    TargetPathExhausted { path: PathBuf },

    /// The timestamped backup copy of an index file could not be created or
    /// did not match the live file after copying.
    #[error("Index backup failed: {}: {reason}", .path.display())]
    IndexBackup { path: PathBuf, reason: String },

    /// A precondition inside the engine was violated. Always a programmer
    /// error, never a user error.
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

/// Convenience type alias for `Result<T, VaultError>`.
pub type Result<T> = std::result::Result<T, VaultError>;
