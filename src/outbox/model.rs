//! The `OutboxMessage` domain type and its row representation.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Queued,
    Sending,
    Sent,
    Failed,
    Canceled,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::Sending => "sending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<OutboxStatus, StoreError> {
        match s {
            "queued" => Ok(OutboxStatus::Queued),
            "sending" => Ok(OutboxStatus::Sending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed" => Ok(OutboxStatus::Failed),
            "canceled" => Ok(OutboxStatus::Canceled),
            other => Err(StoreError::Database(sqlx::Error::Decode(
                format!("unrecognized outbox status {other:?}").into(),
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub participant_id: String,
    pub kind: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct EnqueueSendOptions {
    #[builder(setter(into))]
    pub participant_id: String,
    #[builder(setter(into))]
    pub kind: String,
    #[builder(setter(into))]
    pub payload: String,
    #[builder(default, setter(strip_option, into))]
    pub dedupe_key: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    pub id: String,
    pub participant_id: String,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub attempts: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxMessage {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
            participant_id: row.participant_id,
            kind: row.kind,
            payload: row.payload,
            status: OutboxStatus::parse(&row.status)?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            locked_at: row.locked_at,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
