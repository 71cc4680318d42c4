//! Durable persistence and the claim/mark-sent/fail/cancel state machine
//! for outbound messages. Mirrors `jobs::JobRepository` but never
//! auto-promotes a message to `failed` on its own: `fail` always
//! reschedules, since giving up on a send is an operator/caller decision
//! (see `fail_with_limit` for the opt-in bounded variant).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Pool, Store};

use super::model::{EnqueueSendOptions, OutboxMessage, OutboxRow, OutboxStatus};

/// Select-then-update the due set against an already-open `BEGIN IMMEDIATE`
/// connection. Split out so the caller can roll back on any error instead of
/// leaving the write transaction open.
async fn claim_due_sqlite(
    conn: &mut sqlx::SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<OutboxRow>, sqlx::Error> {
    let due: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM outbox_messages WHERE status = 'queued' \
         AND (next_attempt_at IS NULL OR next_attempt_at <= ?1) \
         ORDER BY created_at ASC LIMIT ?2",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    let mut claimed = Vec::with_capacity(due.len());
    for (id,) in due {
        sqlx::query(
            "UPDATE outbox_messages SET status = 'sending', locked_at = ?1, \
             updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(&id)
        .execute(&mut *conn)
        .await?;

        let row: OutboxRow = sqlx::query_as("SELECT * FROM outbox_messages WHERE id = ?1")
            .bind(&id)
            .fetch_one(&mut *conn)
            .await?;
        claimed.push(row);
    }
    Ok(claimed)
}

pub struct OutboxRepository {
    store: Arc<Store>,
}

impl OutboxRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, opts: EnqueueSendOptions) -> Result<Uuid, StoreError> {
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
                    "INSERT INTO outbox_messages (id, participant_id, kind, payload, status, \
                     attempts, dedupe_key, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'queued', 0, $5, now(), now())",
                )
                .bind(id.to_string())
                .bind(&opts.participant_id)
                .bind(&opts.kind)
                .bind(&opts.payload)
                .bind(&dedupe_key)
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                let now = Utc::now();
                sqlx::query(
                    "INSERT INTO outbox_messages (id, participant_id, kind, payload, status, \
                     attempts, dedupe_key, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 'queued', 0, ?5, ?6, ?6)",
                )
                .bind(id.to_string())
                .bind(&opts.participant_id)
                .bind(&opts.kind)
                .bind(&opts.payload)
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
                    "SELECT id FROM outbox_messages WHERE dedupe_key = $1 \
                     AND status NOT IN ('sent', 'canceled') LIMIT 1",
                )
                .bind(key)
                .fetch_optional(pool)
                .await?
            }
            Pool::Sqlite(pool) => {
                sqlx::query_as(
                    "SELECT id FROM outbox_messages WHERE dedupe_key = ?1 \
                     AND status NOT IN ('sent', 'canceled') LIMIT 1",
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

    pub async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, StoreError> {
        let row: Option<OutboxRow> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as("SELECT * FROM outbox_messages WHERE id = $1")
                    .bind(id.to_string())
                    .fetch_optional(pool)
                    .await?
            }
            Pool::Sqlite(pool) => {
                sqlx::query_as("SELECT * FROM outbox_messages WHERE id = ?1")
                    .bind(id.to_string())
                    .fetch_optional(pool)
                    .await?
            }
        };
        row.map(OutboxMessage::try_from).transpose()
    }

    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<OutboxRow> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as(
                    "WITH due AS ( \
                        SELECT id FROM outbox_messages \
                        WHERE status = 'queued' \
                          AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
                        ORDER BY created_at ASC \
                        LIMIT $2 \
                        FOR UPDATE SKIP LOCKED \
                     ) \
                     UPDATE outbox_messages SET status = 'sending', locked_at = $1, updated_at = $1 \
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

        rows.into_iter().map(OutboxMessage::try_from).collect()
    }

    pub async fn mark_sent(&self, id: Uuid) -> Result<(), StoreError> {
        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'sent', locked_at = NULL, \
                     updated_at = now() WHERE id = $1 AND status NOT IN ('sent', 'canceled')",
                )
                .bind(id.to_string())
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'sent', locked_at = NULL, \
                     updated_at = ?2 WHERE id = ?1 AND status NOT IN ('sent', 'canceled')",
                )
                .bind(id.to_string())
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Record a send failure. Always reschedules at `next_attempt_at`; the
    /// core never gives up on its own. Pass `None` for `give_up_after` to
    /// retry forever, matching the plain `fail` semantics.
    pub async fn fail_with_limit(
        &self,
        id: Uuid,
        err: &str,
        next_attempt_at: DateTime<Utc>,
        give_up_after: Option<i64>,
    ) -> Result<(), StoreError> {
        let Some(msg) = self.get(id).await? else {
            return Ok(());
        };
        if matches!(msg.status, OutboxStatus::Sent | OutboxStatus::Canceled) {
            return Ok(());
        }

        let next_attempts = msg.attempts + 1;
        let give_up = give_up_after.is_some_and(|limit| next_attempts >= limit);

        match self.store.pool() {
            Pool::Postgres(pool) => {
                if give_up {
                    sqlx::query(
                        "UPDATE outbox_messages SET status = 'failed', attempts = $2, \
                         last_error = $3, locked_at = NULL, updated_at = now() WHERE id = $1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempts)
                    .bind(err)
                    .execute(pool)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE outbox_messages SET status = 'queued', attempts = $2, \
                         next_attempt_at = $3, last_error = $4, locked_at = NULL, \
                         updated_at = now() WHERE id = $1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempts)
                    .bind(next_attempt_at)
                    .bind(err)
                    .execute(pool)
                    .await?;
                }
            }
            Pool::Sqlite(pool) => {
                let now = Utc::now();
                if give_up {
                    sqlx::query(
                        "UPDATE outbox_messages SET status = 'failed', attempts = ?2, \
                         last_error = ?3, locked_at = NULL, updated_at = ?4 WHERE id = ?1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempts)
                    .bind(err)
                    .bind(now)
                    .execute(pool)
                    .await?;
                } else {
                    sqlx::query(
                        "UPDATE outbox_messages SET status = 'queued', attempts = ?2, \
                         next_attempt_at = ?3, last_error = ?4, locked_at = NULL, \
                         updated_at = ?5 WHERE id = ?1",
                    )
                    .bind(id.to_string())
                    .bind(next_attempts)
                    .bind(next_attempt_at)
                    .bind(err)
                    .bind(now)
                    .execute(pool)
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Plain failure recovery: always reschedules, never gives up.
    pub async fn fail(
        &self,
        id: Uuid,
        err: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.fail_with_limit(id, err, next_attempt_at, None).await
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'canceled', locked_at = NULL, \
                     updated_at = now() WHERE id = $1 AND status NOT IN ('sent', 'canceled')",
                )
                .bind(id.to_string())
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'canceled', locked_at = NULL, \
                     updated_at = ?2 WHERE id = ?1 AND status NOT IN ('sent', 'canceled')",
                )
                .bind(id.to_string())
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn requeue_stale_sending(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let affected = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'queued', locked_at = NULL, \
                     updated_at = now() WHERE status = 'sending' AND locked_at < $1",
                )
                .bind(stale_before)
                .execute(pool)
                .await?
                .rows_affected()
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE outbox_messages SET status = 'queued', locked_at = NULL, \
                     updated_at = ?2 WHERE status = 'sending' AND locked_at < ?1",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::Duration as ChronoDuration;

    async fn repo() -> OutboxRepository {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        OutboxRepository::new(store)
    }

    #[tokio::test]
    async fn enqueue_claim_and_mark_sent() {
        let repo = repo().await;
        let now = Utc::now();
        let id = repo
            .enqueue(
                EnqueueSendOptions::builder()
                    .participant_id("p1")
                    .kind("sms")
                    .payload("hi")
                    .build(),
            )
            .await
            .unwrap();

        let claimed = repo.claim_due(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OutboxStatus::Sending);

        repo.mark_sent(id).await.unwrap();
        let msg = repo.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Sent);
    }

    #[tokio::test]
    async fn fail_never_auto_exhausts_by_default() {
        let repo = repo().await;
        let now = Utc::now();
        let id = repo
            .enqueue(
                EnqueueSendOptions::builder()
                    .participant_id("p1")
                    .kind("sms")
                    .payload("hi")
                    .build(),
            )
            .await
            .unwrap();

        for i in 0..10 {
            repo.claim_due(now + ChronoDuration::seconds(i * 100), 10)
                .await
                .unwrap();
            repo.fail(id, "down", now + ChronoDuration::seconds(i * 100 + 50))
                .await
                .unwrap();
        }

        let msg = repo.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Queued);
        assert_eq!(msg.attempts, 10);
    }

    #[tokio::test]
    async fn fail_with_limit_gives_up_when_asked() {
        let repo = repo().await;
        let now = Utc::now();
        let id = repo
            .enqueue(
                EnqueueSendOptions::builder()
                    .participant_id("p1")
                    .kind("sms")
                    .payload("hi")
                    .build(),
            )
            .await
            .unwrap();

        repo.claim_due(now, 10).await.unwrap();
        repo.fail_with_limit(id, "down", now + ChronoDuration::seconds(1), Some(1))
            .await
            .unwrap();

        let msg = repo.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Failed);
    }

    #[tokio::test]
    async fn requeue_stale_sending_recovers_abandoned_rows() {
        let repo = repo().await;
        let now = Utc::now();
        let id = repo
            .enqueue(
                EnqueueSendOptions::builder()
                    .participant_id("p1")
                    .kind("sms")
                    .payload("hi")
                    .build(),
            )
            .await
            .unwrap();
        repo.claim_due(now, 10).await.unwrap();

        let n = repo
            .requeue_stale_sending(now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(n, 1);
        let msg = repo.get(id).await.unwrap().unwrap();
        assert_eq!(msg.status, OutboxStatus::Queued);
    }
}
