//! End-to-end coverage of the job runner loop against an in-memory SQLite
//! store: registration, dispatch, retry backoff, and exhaustion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::jobs::{EnqueueOptions, JobRegistry, JobRepository, JobRunner, JobRunnerConfig, JobStatus};
use dispatch_core::store::Store;
use tokio_util::sync::CancellationToken;

async fn in_memory_repo() -> Arc<JobRepository> {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    Arc::new(JobRepository::new(store))
}

#[tokio::test]
async fn enqueued_job_is_claimed_and_dispatched_to_its_handler() {
    let repo = in_memory_repo().await;
    let registry = Arc::new(JobRegistry::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    registry.register("email", move |_payload| {
        let calls = calls2.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let id = repo
        .enqueue(
            EnqueueOptions::builder()
                .kind("email")
                .run_at(Utc::now() - chrono::Duration::seconds(1))
                .payload(r#"{"to":"x"}"#)
                .build(),
        )
        .await
        .unwrap();

    let runner = JobRunner::new(
        repo.clone(),
        registry,
        JobRunnerConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_clone).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}

#[tokio::test]
async fn missing_handler_reschedules_without_crashing_the_loop() {
    let repo = in_memory_repo().await;
    let registry = Arc::new(JobRegistry::new());

    let id = repo
        .enqueue(
            EnqueueOptions::builder()
                .kind("unregistered")
                .run_at(Utc::now() - chrono::Duration::seconds(1))
                .payload("")
                .build(),
        )
        .await
        .unwrap();

    let runner = JobRunner::new(
        repo.clone(),
        registry,
        JobRunnerConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_clone).await });

    tokio::time::sleep(Duration::from_millis(80)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
    assert!(job.run_at > Utc::now());
}

#[tokio::test]
async fn crash_recovery_requeues_abandoned_running_job_exactly_once() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let repo = Arc::new(JobRepository::new(store));

    let id = repo
        .enqueue(
            EnqueueOptions::builder()
                .kind("restart")
                .run_at(Utc::now())
                .payload("")
                .dedupe_key("restart")
                .build(),
        )
        .await
        .unwrap();

    // Simulate process A claiming the job then crashing before completion.
    let claimed = repo.claim_due(Utc::now(), 10).await.unwrap();
    assert_eq!(claimed[0].id, id);

    // Process B starts up, shrinks the stale threshold to cover the gap,
    // and recovers the abandoned row.
    let recovered = repo
        .requeue_stale_running(Utc::now() + chrono::Duration::milliseconds(1))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let registry = Arc::new(JobRegistry::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    registry.register("restart", move |_payload| {
        let calls = calls2.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let runner = JobRunner::new(
        repo.clone(),
        registry,
        JobRunnerConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        },
    );
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_clone).await });
    tokio::time::sleep(Duration::from_millis(80)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let job = repo.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done);
}
