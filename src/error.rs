//! Structured error types for the handful of failure modes that callers need
//! to branch on. Everything else propagates as `anyhow::Error`.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to acquire the single-instance lock on a state directory.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("store directory {path:?} is locked by another process (pid {pid}, {})",
        if *alive { "alive" } else { "liveness unknown" })]
    Held {
        path: PathBuf,
        pid: u32,
        alive: bool,
    },

    #[error("failed to create lock file: {0}")]
    CreateFailed(#[source] std::io::Error),

    #[error("failed to acquire lock: {0}")]
    AcquireFailed(#[source] std::io::Error),
}

/// Failure to classify or resolve a connection string.
#[derive(Debug, Error)]
pub enum DsnError {
    #[error("could not derive a filesystem path from DSN {0:?}")]
    UnresolvablePath(String),

    #[error("empty DSN")]
    Empty,
}

/// Failure opening the store (connecting + applying schema).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("dsn error: {0}")]
    Dsn(#[from] DsnError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("failed to prepare state directory {0:?}: {1}")]
    Directory(PathBuf, #[source] std::io::Error),
}
