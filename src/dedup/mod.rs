//! At-most-once inbound message processing.
//!
//! The ledger's only job is membership: once a message id has been
//! recorded, every subsequent `record_inbound` call for that id is a no-op
//! and reports `is_new = false`.

use std::sync::Arc;

use chrono::Utc;

use crate::error::StoreError;
use crate::store::{Pool, Store};

pub struct DedupRepository {
    store: Arc<Store>,
}

impl DedupRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn is_duplicate(&self, message_id: &str) -> Result<bool, StoreError> {
        let row: Option<(String,)> = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query_as("SELECT message_id FROM inbound_dedup WHERE message_id = $1")
                    .bind(message_id)
                    .fetch_optional(pool)
                    .await?
            }
            Pool::Sqlite(pool) => {
                sqlx::query_as("SELECT message_id FROM inbound_dedup WHERE message_id = ?1")
                    .bind(message_id)
                    .fetch_optional(pool)
                    .await?
            }
        };
        Ok(row.is_some())
    }

    /// Insert `message_id` if absent. Returns `true` iff this call actually
    /// inserted the row (i.e. the message had never been seen before).
    pub async fn record_inbound(
        &self,
        message_id: &str,
        participant_id: &str,
    ) -> Result<bool, StoreError> {
        let inserted = match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO inbound_dedup (message_id, participant_id, received_at) \
                     VALUES ($1, $2, now()) ON CONFLICT (message_id) DO NOTHING",
                )
                .bind(message_id)
                .bind(participant_id)
                .execute(pool)
                .await?
                .rows_affected()
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "INSERT INTO inbound_dedup (message_id, participant_id, received_at) \
                     VALUES (?1, ?2, ?3) ON CONFLICT (message_id) DO NOTHING",
                )
                .bind(message_id)
                .bind(participant_id)
                .bind(Utc::now())
                .execute(pool)
                .await?
                .rows_affected()
            }
        };
        Ok(inserted > 0)
    }

    pub async fn mark_processed(&self, message_id: &str) -> Result<(), StoreError> {
        match self.store.pool() {
            Pool::Postgres(pool) => {
                sqlx::query(
                    "UPDATE inbound_dedup SET processed_at = now() \
                     WHERE message_id = $1 AND processed_at IS NULL",
                )
                .bind(message_id)
                .execute(pool)
                .await?;
            }
            Pool::Sqlite(pool) => {
                sqlx::query(
                    "UPDATE inbound_dedup SET processed_at = ?2 \
                     WHERE message_id = ?1 AND processed_at IS NULL",
                )
                .bind(message_id)
                .bind(Utc::now())
                .execute(pool)
                .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    async fn repo() -> DedupRepository {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        DedupRepository::new(store)
    }

    #[tokio::test]
    async fn first_record_is_new_second_is_not() {
        let repo = repo().await;
        assert!(repo.record_inbound("msg-1", "p1").await.unwrap());
        assert!(!repo.record_inbound("msg-1", "p1").await.unwrap());
        assert!(repo.is_duplicate("msg-1").await.unwrap());
        assert!(!repo.is_duplicate("msg-2").await.unwrap());
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let repo = repo().await;
        repo.record_inbound("msg-1", "p1").await.unwrap();
        repo.mark_processed("msg-1").await.unwrap();
        repo.mark_processed("msg-1").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_record_inbound_yields_exactly_one_new() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let repo = Arc::new(DedupRepository::new(store));

        let r1 = repo.clone();
        let r2 = repo.clone();
        let (a, b) = tokio::join!(
            r1.record_inbound("race-1", "p1"),
            r2.record_inbound("race-1", "p1"),
        );
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|v| **v).count(), 1);
    }
}
