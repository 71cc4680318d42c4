//! Startup recovery, background-loop lifecycle, and graceful shutdown.
//!
//! Acquisition order mirrors a crash-safe daemon startup: lock the state
//! directory before touching anything else, open the store (which applies
//! the schema), recover stale rows, register OS signal handlers, and only
//! then start serving work. On shutdown (ctrl-c or an explicit caller-driven
//! cancel) the cancellation token is flipped and the loops are awaited with
//! a bounded timeout before the lock is released.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dsn;
use crate::error::{DsnError, LockError, StoreError};
use crate::jobs::{JobRepository, JobRunner, JobRunnerConfig, SharedJobRegistry};
use crate::lock::Lock;
use crate::outbox::{OutboxRepository, OutboxSender, OutboxSenderConfig, SendFn};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Dsn(#[from] DsnError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Shutdown grace period: how long `shutdown()` waits for the runner and
/// sender loops to notice cancellation and return before giving up on them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the lock, the store, and the two background loops.
pub struct Supervisor {
    _lock: Option<Lock>,
    store: Arc<Store>,
    job_repository: Arc<JobRepository>,
    outbox_repository: Arc<OutboxRepository>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Acquire the lock (for file-backed stores; networked stores rely on
    /// the database itself for coordination and skip the filesystem lock),
    /// open the store, and recover stale rows. Does not yet start the
    /// background loops — call `start` for that.
    pub async fn bootstrap(config: &Config) -> Result<Supervisor, SupervisorError> {
        let backend = dsn::classify(&config.database_url);
        let lock = match backend {
            crate::dsn::Backend::File => {
                let dir = dsn::dir_of(&config.database_url)?;
                Some(Lock::acquire(&dir)?)
            }
            crate::dsn::Backend::Network => None,
        };

        let store = Arc::new(Store::open(&config.database_url).await?);
        let job_repository = Arc::new(JobRepository::new(store.clone()));
        let outbox_repository = Arc::new(OutboxRepository::new(store.clone()));

        Ok(Supervisor {
            _lock: lock,
            store,
            job_repository,
            outbox_repository,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn job_repository(&self) -> &Arc<JobRepository> {
        &self.job_repository
    }

    pub fn outbox_repository(&self) -> &Arc<OutboxRepository> {
        &self.outbox_repository
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Recover stale rows, then spawn the job runner and outbox sender
    /// loops as background tasks sharing this supervisor's cancellation
    /// token.
    pub async fn start(
        &mut self,
        registry: SharedJobRegistry,
        job_config: JobRunnerConfig,
        send: SendFn,
        sender_config: OutboxSenderConfig,
    ) -> anyhow::Result<()> {
        let runner = JobRunner::new(self.job_repository.clone(), registry, job_config);
        runner.recover_stale_jobs().await?;

        let sender = OutboxSender::new(self.outbox_repository.clone(), send, sender_config);
        sender.recover_stale_messages().await?;

        let signal_shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    signal_shutdown.cancel();
                }
                _ = signal_shutdown.cancelled() => {}
            }
        }));

        let runner_shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            if let Err(e) = runner.run(runner_shutdown).await {
                tracing::error!(error = %e, "job runner exited with error");
            }
        }));

        let sender_shutdown = self.shutdown.clone();
        self.handles.push(tokio::spawn(async move {
            if let Err(e) = sender.run(sender_shutdown).await {
                tracing::error!(error = %e, "outbox sender exited with error");
            }
        }));

        info!("supervisor started");
        Ok(())
    }

    /// Cancel the shared token and wait (bounded) for the loops to exit,
    /// then release the lock.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();

        let wait = async {
            for handle in self.handles.drain(..) {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
            warn!("background loops did not exit within the grace period");
        }

        if let Some(mut lock) = self._lock.take() {
            lock.release();
        }
        info!("supervisor stopped");
    }
}

