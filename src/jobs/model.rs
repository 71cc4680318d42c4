//! The `Job` domain type and its on-the-wire row representation.
//!
//! Status is persisted as plain `TEXT` rather than a backend-native enum
//! column so the same row shape and `TryFrom` conversion work unmodified
//! against both Postgres and SQLite.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<JobStatus, StoreError> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(StoreError::Database(sqlx::Error::Decode(
                format!("unrecognized job status {other:?}").into(),
            ))),
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub kind: String,
    pub run_at: DateTime<Utc>,
    pub payload: String,
    pub status: JobStatus,
    pub attempt: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Options accepted by `JobRepository::enqueue`.
#[derive(Debug, Clone, typed_builder::TypedBuilder)]
pub struct EnqueueOptions {
    #[builder(setter(into))]
    pub kind: String,
    pub run_at: DateTime<Utc>,
    #[builder(setter(into))]
    pub payload: String,
    #[builder(default, setter(strip_option, into))]
    pub dedupe_key: Option<String>,
    #[builder(default = 3)]
    pub max_attempts: i64,
}

/// Raw row shape as decoded from either backend.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub run_at: DateTime<Utc>,
    pub payload: String,
    pub status: String,
    pub attempt: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?,
            kind: row.kind,
            run_at: row.run_at,
            payload: row.payload,
            status: JobStatus::parse(&row.status)?,
            attempt: row.attempt,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            locked_at: row.locked_at,
            dedupe_key: row.dedupe_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!(JobStatus::parse("bogus").is_err());
    }
}
