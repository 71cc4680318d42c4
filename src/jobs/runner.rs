//! Polls for due jobs and dispatches them to the registered handler.
//!
//! Cancellation is observed between ticks and before the next claim, never
//! by interrupting a handler mid-flight: aborting a half-finished handler
//! would leave no record of what it actually did.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::SharedJobRegistry;
use super::repository::JobRepository;

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub claim_batch_limit: i64,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        }
    }
}

pub struct JobRunner {
    repository: Arc<JobRepository>,
    registry: SharedJobRegistry,
    config: JobRunnerConfig,
}

impl JobRunner {
    pub fn new(
        repository: Arc<JobRepository>,
        registry: SharedJobRegistry,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            repository,
            registry,
            config,
        }
    }

    /// Requeue jobs abandoned by a crashed prior instance. Call once at
    /// startup before `run`.
    pub async fn recover_stale_jobs(&self) -> Result<u64> {
        let stale_before =
            Utc::now() - chrono::Duration::from_std(self.config.stale_threshold).unwrap();
        let n = self.repository.requeue_stale_running(stale_before).await?;
        if n > 0 {
            info!(recovered = n, "requeued stale running jobs");
        }
        Ok(n)
    }

    /// Run the poll loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch = self.config.claim_batch_limit,
            "job runner starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let jobs = match self
                .repository
                .claim_due(now, self.config.claim_batch_limit)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!(error = %e, "failed to claim jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            for job in jobs {
                if !self.registry.is_registered(&job.kind) {
                    warn!(job_id = %job.id, kind = %job.kind, "no handler registered");
                    let next_run_at = Utc::now() + chrono::Duration::seconds(60);
                    if let Err(e) = self
                        .repository
                        .fail(job.id, "no handler registered for job kind", next_run_at)
                        .await
                    {
                        error!(job_id = %job.id, error = %e, "failed to record missing-handler failure");
                    }
                    continue;
                }

                let result = self.registry.dispatch(&job.kind, job.payload.clone()).await;
                match result {
                    Ok(()) => {
                        if let Err(e) = self.repository.complete(job.id).await {
                            error!(job_id = %job.id, error = %e, "failed to mark job complete");
                        }
                    }
                    Err(e) => {
                        let backoff_secs = 30i64.saturating_mul(1i64 << job.attempt.min(10));
                        let next_run_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
                        warn!(job_id = %job.id, kind = %job.kind, error = %e, "job handler failed");
                        if let Err(e2) = self
                            .repository
                            .fail(job.id, &e.to_string(), next_run_at)
                            .await
                        {
                            error!(job_id = %job.id, error = %e2, "failed to record job failure");
                        }
                    }
                }
            }
        }

        info!("job runner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_documented_values() {
        let config = JobRunnerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
        assert_eq!(config.claim_batch_limit, 10);
    }
}
