//! Polls for due outbox messages and hands each to an injected `send`
//! callback. Success marks the row sent; failure reschedules with backoff.
//! The sender never gives up on its own (see `OutboxRepository::fail`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::OutboxMessage;
use super::repository::OutboxRepository;

pub type SendFn =
    Arc<dyn Fn(&OutboxMessage) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct OutboxSenderConfig {
    pub poll_interval: Duration,
    pub stale_threshold: Duration,
    pub claim_batch_limit: i64,
}

impl Default for OutboxSenderConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        }
    }
}

pub struct OutboxSender {
    repository: Arc<OutboxRepository>,
    send: SendFn,
    config: OutboxSenderConfig,
}

impl OutboxSender {
    pub fn new(repository: Arc<OutboxRepository>, send: SendFn, config: OutboxSenderConfig) -> Self {
        Self {
            repository,
            send,
            config,
        }
    }

    pub async fn recover_stale_messages(&self) -> Result<u64> {
        let stale_before =
            Utc::now() - chrono::Duration::from_std(self.config.stale_threshold).unwrap();
        let n = self
            .repository
            .requeue_stale_sending(stale_before)
            .await?;
        if n > 0 {
            info!(recovered = n, "requeued stale sending messages");
        }
        Ok(n)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            poll_interval = ?self.config.poll_interval,
            batch = self.config.claim_batch_limit,
            "outbox sender starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let messages = match self
                .repository
                .claim_due(now, self.config.claim_batch_limit)
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    error!(error = %e, "failed to claim outbox messages");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                    continue;
                }
            };

            if messages.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = messages.len(), "claimed outbox messages");

            for msg in messages {
                let result = (self.send)(&msg).await;
                match result {
                    Ok(()) => {
                        if let Err(e) = self.repository.mark_sent(msg.id).await {
                            error!(message_id = %msg.id, error = %e, "failed to mark message sent");
                        }
                    }
                    Err(e) => {
                        let backoff_secs = 10i64.saturating_mul(1i64 << msg.attempts.min(10));
                        let next_attempt_at = Utc::now() + chrono::Duration::seconds(backoff_secs);
                        warn!(message_id = %msg.id, error = %e, "send failed");
                        if let Err(e2) = self
                            .repository
                            .fail(msg.id, &e.to_string(), next_attempt_at)
                            .await
                        {
                            error!(message_id = %msg.id, error = %e2, "failed to record send failure");
                        }
                    }
                }
            }
        }

        info!("outbox sender stopped");
        Ok(())
    }
}
