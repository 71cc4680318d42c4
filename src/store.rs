//! Owns the connection pool and applies the fixed, idempotent schema on
//! open. Both backends expose the same logical tables; columns that would
//! need a native enum type on Postgres are kept as plain `TEXT` with a
//! `CHECK` constraint so the same row-DTO/TryFrom conversion works
//! regardless of which backend is in use underneath.

use std::path::Path;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use tracing::info;

use crate::dsn::{self, Backend};
use crate::error::StoreError;

/// The live connection pool, backend-tagged so repositories know which SQL
/// dialect to speak.
#[derive(Clone)]
pub enum Pool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// An open, schema-migrated store.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    backend: Backend,
}

impl Store {
    /// Classify `dsn`, connect, and apply the schema. For a file DSN, the
    /// parent directory is created if missing and the pool is capped at a
    /// single connection (SQLite allows exactly one writer).
    pub async fn open(dsn: &str) -> Result<Store, StoreError> {
        let backend = dsn::classify(dsn);
        let pool = match backend {
            Backend::Network => {
                let pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(dsn)
                    .await?;
                Pool::Postgres(pool)
            }
            Backend::File => {
                let path = dsn::file_path_of(dsn)?;
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| StoreError::Directory(parent.to_path_buf(), e))?;
                    }
                }
                let pool = open_sqlite(&path).await?;
                Pool::Sqlite(pool)
            }
        };

        let store = Store { pool, backend };
        store.apply_schema().await?;
        info!(backend = ?store.backend, "store opened");
        Ok(store)
    }

    /// Open an in-memory SQLite store. Intended for tests.
    pub async fn open_in_memory() -> Result<Store, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .in_memory(true)
                    .create_if_missing(true),
            )
            .await?;
        let store = Store {
            pool: Pool::Sqlite(pool),
            backend: Backend::File,
        };
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        match &self.pool {
            Pool::Postgres(pool) => {
                for stmt in POSTGRES_SCHEMA.split(";\n\n") {
                    let stmt = stmt.trim();
                    if stmt.is_empty() {
                        continue;
                    }
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
            Pool::Sqlite(pool) => {
                sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
                sqlx::query("PRAGMA synchronous=NORMAL").execute(pool).await?;
                for stmt in SQLITE_SCHEMA.split(";\n\n") {
                    let stmt = stmt.trim();
                    if stmt.is_empty() {
                        continue;
                    }
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }
}

async fn open_sqlite(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
        )
        .await
}

const POSTGRES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    run_at TIMESTAMPTZ NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued','running','done','failed','canceled')),
    attempt BIGINT NOT NULL DEFAULT 0,
    max_attempts BIGINT NOT NULL DEFAULT 3,
    last_error TEXT,
    locked_at TIMESTAMPTZ,
    dedupe_key TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS jobs_status_run_at_idx ON jobs (status, run_at);

CREATE INDEX IF NOT EXISTS jobs_kind_idx ON jobs (kind);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_dedupe_key_active_idx ON jobs (dedupe_key)
    WHERE dedupe_key IS NOT NULL AND status NOT IN ('done', 'canceled');

CREATE TABLE IF NOT EXISTS outbox_messages (
    id TEXT PRIMARY KEY,
    participant_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued','sending','sent','failed','canceled')),
    attempts BIGINT NOT NULL DEFAULT 0,
    next_attempt_at TIMESTAMPTZ,
    last_error TEXT,
    locked_at TIMESTAMPTZ,
    dedupe_key TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS outbox_status_next_attempt_idx ON outbox_messages (status, next_attempt_at);

CREATE INDEX IF NOT EXISTS outbox_participant_idx ON outbox_messages (participant_id);

CREATE UNIQUE INDEX IF NOT EXISTS outbox_dedupe_key_active_idx ON outbox_messages (dedupe_key)
    WHERE dedupe_key IS NOT NULL AND status NOT IN ('sent', 'canceled');

CREATE TABLE IF NOT EXISTS inbound_dedup (
    message_id TEXT PRIMARY KEY,
    participant_id TEXT NOT NULL,
    received_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    processed_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS inbound_dedup_participant_idx ON inbound_dedup (participant_id);
"#;

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    run_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued','running','done','failed','canceled')),
    attempt INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    last_error TEXT,
    locked_at TEXT,
    dedupe_key TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS jobs_status_run_at_idx ON jobs (status, run_at);

CREATE INDEX IF NOT EXISTS jobs_kind_idx ON jobs (kind);

CREATE UNIQUE INDEX IF NOT EXISTS jobs_dedupe_key_active_idx ON jobs (dedupe_key)
    WHERE dedupe_key IS NOT NULL AND status NOT IN ('done', 'canceled');

CREATE TABLE IF NOT EXISTS outbox_messages (
    id TEXT PRIMARY KEY,
    participant_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued','sending','sent','failed','canceled')),
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at TEXT,
    last_error TEXT,
    locked_at TEXT,
    dedupe_key TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS outbox_status_next_attempt_idx ON outbox_messages (status, next_attempt_at);

CREATE INDEX IF NOT EXISTS outbox_participant_idx ON outbox_messages (participant_id);

CREATE UNIQUE INDEX IF NOT EXISTS outbox_dedupe_key_active_idx ON outbox_messages (dedupe_key)
    WHERE dedupe_key IS NOT NULL AND status NOT IN ('sent', 'canceled');

CREATE TABLE IF NOT EXISTS inbound_dedup (
    message_id TEXT PRIMARY KEY,
    participant_id TEXT NOT NULL,
    received_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    processed_at TEXT
);

CREATE INDEX IF NOT EXISTS inbound_dedup_participant_idx ON inbound_dedup (participant_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_applies_schema_idempotently() {
        let store = Store::open_in_memory().await.unwrap();
        store.apply_schema().await.unwrap();
        assert_eq!(store.backend(), Backend::File);
    }
}
