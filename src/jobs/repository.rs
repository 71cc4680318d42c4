//! Durable persistence and the claim/complete/fail/cancel state machine for
//! jobs. The Postgres path claims with a single `FOR UPDATE SKIP LOCKED`
//! statement; the SQLite path serializes the same select-then-update inside
//! a real `BEGIN IMMEDIATE` transaction on a connection acquired directly
//! from the pool (sqlx's own `pool.begin()` already issues a plain `BEGIN`,
//! which would collide with it), rolling back on any error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Pool, Store};

use super::model::{EnqueueOptions, Job, JobRow, JobStatus};

/// Select-then-update the due set against an already-open `BEGIN IMMEDIATE`
/// connection. Split out so the caller can roll back on any error instead of
/// leaving the write transaction open.
async fn claim_due_sqlite(
    conn: &mut sqlx::SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<JobRow>, sqlx::Error> {
    let due: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM jobs WHERE status = 'queued' AND run_at <= ?1 \
         ORDER BY run_at ASC, created_at ASC LIMIT ?2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut claimed = Vec::with_capacity(due.len());
    for (id,) in due {
        sqlx::query(
            "UPDATE jobs SET status = 'running', locked_at = ?1, updated_at = ?1 \
             WHERE id = ?2",
        )
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await?;

        let row: JobRow = sqlx::query_as("SELECT * FROM jobs WHERE id = ?1")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await?;
        claimed.push(row);
    }
    Ok(claimed)
}

/// Repository over the `jobs` table.
pub struct JobRepository {
    store: Arc<Store>,
}

impl JobRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Insert a new job, or return the existing id if `dedupe_key` is
    /// non-empty and already claimed by a non-terminal row.
    pub async fn enqueue(&self, opts: EnqueueOptions) -> Result<Uuid, StoreError> {
        if let Some(key) = opts.dedupe_key.as_deref().filter(|k| !k.is_empty()) {
            if let Some(existing) = self.find_active_by_dedupe_key(key).await? {
                return Ok(existing);
            }
        }

        let id = Uuid::now_v7();
        let dedupe_key = opts.dedupe_key.filter(|k| !k.is_empty());

        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO jobs (id, kind, run_at, payload, status, attempt, \
                     max_attempts, dedupe_key, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'queued', 0, $5, $6, now(), now())",
                )
                .bind(id.to_string())
                .bind(&opts.kind)
                .bind(opts.run_at)
                .bind(&opts.payload)
                .bind(opts.max_attempts)
                .bind(&dedupe_key)
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                let now = Utc::now();
                sqlx::query(
                    "INSERT INTO jobs (id, kind, run_at, payload, status, attempt, \
                     max_attempts, dedupe_key, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?7, ?7)",
                )
                .bind(id.to_string())
                .bind(&opts.kind)
                .bind(opts.run_at)
                .bind(&opts.payload)
                .bind(opts.max_attempts)
                .bind(&dedupe_key)
                .bind(now)
                .execute(pool)
                .await?;
            }
        }

        Ok(id)
    }

    async fn find_active_by_dedupe_key(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(String,)> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as(
                    "SELECT id FROM jobs WHERE dedupe_key = $1 \
                     AND status NOT IN ('done', 'canceled') LIMIT 1",
                )
                .bind(key)
                .fetch_optional(pool)
                .await?
            }
            Pool::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT id FROM jobs WHERE dedupe_key = ?1 \
                     AND status NOT IN ('done', 'canceled') LIMIT 1",
                )
                .bind(key)
                .fetch_optional(pool)
                .await?
            }
        };
        row.map(|(id,)| {
            Uuid::parse_str(&id).map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
        })
        .transpose()
    }

    /// Read-only lookup. Missing rows are `None`, not an error.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
                    .bind(id.to_string())
                    .fetch_optional(pool)
                    .await?
            }
            Pool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM jobs WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(Job::try_from).transpose()
    }

    /// Atomically claim up to `limit` due jobs, ordered by `run_at`.
    pub async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<JobRow> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as(
                    "WITH due AS ( \
                        SELECT id FROM jobs \
                        WHERE status = 'queued' AND run_at <= $1 \
                        ORDER BY run_at ASC, created_at ASC \
                        LIMIT $2 \
                        FOR UPDATE SKIP LOCKED \
                     ) \
                     UPDATE jobs SET status = 'running', locked_at = $1, updated_at = $1 \
                     WHERE id IN (SELECT id FROM due) \
                     RETURNING *",
                )
                .bind(now)
                .bind(limit)
                .fetch_all(pool)
                .await?
            }
            Pool::Sqlite(pool) => {
                let mut conn = pool.acquire().await?;
                sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

                match claim_due_sqlite(&mut conn, now, limit).await {
                    Ok(claimed) => {
                        sqlx::query("COMMIT").execute(&mut *conn).await?;
                        claimed
                    }
                    Err(e) => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                        return Err(e.into());
                    }
                }
            }
        };

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Mark a job done. No-op if already terminal.
    pub async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'done', locked_at = NULL, updated_at = now() \
                     WHERE id = $1 AND status NOT IN ('done', 'canceled')",
                )
                .bind(id.to_string())
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'done', locked_at = NULL, updated_at = ?2 \
                     WHERE id = ?1 AND status NOT IN ('done', 'canceled')",
                )
                .bind(id.to_string())
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Record a failure. If the job has exhausted `max_attempts` it
    /// terminates into `failed`; otherwise it is rescheduled at
    /// `next_run_at` with `attempt` incremented.
    pub async fn fail(
        &self,
        id: Uuid,
        err: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let Some(job) = self.get(id).await? else {
            return Ok(());
        };
        if matches!(job.status, JobStatus::Done | JobStatus::Canceled) {
            return Ok(());
        }

        let next_attempt = job.attempt + 1;
        let exhausted = next_attempt >= job.max_attempts;

        match self.store.pool() {
            Pool::Postgres(pool) => {
                if exhausted {
                    sqlx::query(
                        "UPDATE jobs SET status = 'failed', attempt = $2, last_error = $3, \
                         locked_at = NULL, updated_at = now() WHERE id = $1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempt)
                    .bind(err)
                    .execute(pool)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE jobs SET status = 'queued', attempt = $2, run_at = $3, \
                         last_error = $4, locked_at = NULL, updated_at = now() WHERE id = $1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempt)
                    .bind(next_run_at)
                    .bind(err)
                    .execute(pool)
                    .await?;
                }
            }
            Pool::Sqlite(pool) => {
                let now = Utc::now();
                if exhausted {
                    sqlx::query(
                        "UPDATE jobs SET status = 'failed', attempt = ?2, last_error = ?3, \
                         locked_at = NULL, updated_at = ?4 WHERE id = ?1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempt)
                    .bind(err)
                    .bind(now)
                    .execute(pool)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE jobs SET status = 'queued', attempt = ?2, run_at = ?3, \
                         last_error = ?4, locked_at = NULL, updated_at = ?5 WHERE id = ?1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempt)
                    .bind(next_run_at)
                    .bind(err)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Cancel a job. Idempotent.
    pub async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'canceled', locked_at = NULL, updated_at = now() \
                     WHERE id = $1 AND status NOT IN ('done', 'canceled')",
                )
                .bind(id.to_string())
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'canceled', locked_at = NULL, updated_at = ?2 \
                     WHERE id = ?1 AND status NOT IN ('done', 'canceled')",
                )
                .bind(id.to_string())
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Requeue rows stuck in `running` with `locked_at` older than
    /// `stale_before`. Returns the number of rows recovered.
    pub async fn requeue_stale_running(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let affected = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'queued', locked_at = NULL, updated_at = now() \
                     WHERE status = 'running' AND locked_at < $1",
                )
                .bind(stale_before)
                .execute(pool)
                .await?
                .rows_affected()
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE jobs SET status = 'queued', locked_at = NULL, updated_at = ?2 \
                     WHERE status = 'running' AND locked_at < ?1",
                )
                .bind(stale_before)
                .bind(Utc::now())
                .execute(pool)
                .await?
                .rows_affected()
            }
        };
        Ok(affected)
    }
}
