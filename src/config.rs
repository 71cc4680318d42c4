//! Typed reading of the already-populated process environment.
//!
//! This crate never loads `.env` files and never parses CLI flags; that is
//! the embedding application's job (see `main.rs` in the original server for
//! the bootstrap order this mirrors: logging, then config, then connect).

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime configuration for the store and its background loops.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection string. Required.
    pub database_url: String,
    pub job_poll_interval: Duration,
    pub outbox_poll_interval: Duration,
    pub stale_threshold: Duration,
    pub claim_batch_limit: i64,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        Ok(Self {
            database_url,
            job_poll_interval: Duration::from_secs(env_u64("JOB_POLL_INTERVAL_SECS", 10)),
            outbox_poll_interval: Duration::from_secs(env_u64(
                "OUTBOX_POLL_INTERVAL_SECS",
                5,
            )),
            stale_threshold: Duration::from_secs(env_u64("STALE_THRESHOLD_SECS", 300)),
            claim_batch_limit: env_u64("CLAIM_BATCH_LIMIT", 10) as i64,
        })
    }

    /// Build a config directly, bypassing the environment (used by tests
    /// and by callers that already parsed their own flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            job_poll_interval: Duration::from_secs(10),
            outbox_poll_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_documented_defaults() {
        let cfg = Config::new("sqlite::memory:");
        assert_eq!(cfg.job_poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.outbox_poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.stale_threshold, Duration::from_secs(300));
        assert_eq!(cfg.claim_batch_limit, 10);
    }
}
