//! Classifies a connection string as file-backed or networked, and derives
//! the filesystem directory a file-backed store needs locked.

use std::path::{Path, PathBuf};

use crate::error::DsnError;

/// Which storage backend a DSN points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// An embedded, single-writer file database (SQLite).
    File,
    /// A networked relational database (PostgreSQL).
    Network,
}

/// Inspect a DSN and decide which backend owns it.
///
/// `sqlite:`/`file:` prefixes and `.db`/`.sqlite`/`.sqlite3` suffixes are
/// file-backed. `postgres://`/`postgresql://` prefixes, or a `host=`
/// key-value fragment, are networked. An unrecognized DSN defaults to file,
/// matching the "local by default" posture of the embedded backend.
pub fn classify(dsn: &str) -> Backend {
    let lower = dsn.to_ascii_lowercase();

    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        return Backend::Network;
    }
    if lower.contains("host=") {
        return Backend::Network;
    }
    if lower.starts_with("sqlite:") || lower.starts_with("file:") {
        return Backend::File;
    }
    for suffix in [".db", ".sqlite", ".sqlite3"] {
        if lower.ends_with(suffix) {
            return Backend::File;
        }
    }
    Backend::File
}

/// For a file-backed DSN, resolve the directory that must hold the
/// single-instance lock (the parent directory of the database file).
///
/// Strips the `sqlite:`/`file:` scheme prefix and any trailing `?query`
/// before resolving, so `sqlite:/data/app.db?mode=rwc` resolves to `/data`.
pub fn dir_of(dsn: &str) -> Result<PathBuf, DsnError> {
    if dsn.is_empty() {
        return Err(DsnError::Empty);
    }

    let without_scheme = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .or_else(|| dsn.strip_prefix("file://"))
        .or_else(|| dsn.strip_prefix("file:"))
        .unwrap_or(dsn);

    let without_query = without_scheme
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(without_scheme);

    if without_query.is_empty() {
        return Err(DsnError::UnresolvablePath(dsn.to_string()));
    }

    let path = Path::new(without_query);
    let dir = if path.is_absolute() {
        path.parent().map(Path::to_path_buf)
    } else {
        std::env::current_dir()
            .ok()
            .map(|cwd| cwd.join(path))
            .and_then(|p| p.parent().map(Path::to_path_buf))
    };

    dir.ok_or_else(|| DsnError::UnresolvablePath(dsn.to_string()))
}

/// The bare file path a file DSN resolves to (scheme and query stripped).
pub fn file_path_of(dsn: &str) -> Result<PathBuf, DsnError> {
    if dsn.is_empty() {
        return Err(DsnError::Empty);
    }
    let without_scheme = dsn
        .strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .or_else(|| dsn.strip_prefix("file://"))
        .or_else(|| dsn.strip_prefix("file:"))
        .unwrap_or(dsn);
    let without_query = without_scheme
        .split_once('?')
        .map(|(path, _)| path)
        .unwrap_or(without_scheme);
    if without_query.is_empty() {
        return Err(DsnError::UnresolvablePath(dsn.to_string()));
    }
    Ok(PathBuf::from(without_query))
}
