//! End-to-end coverage of the outbox sender loop: successful send, and
//! retry-without-auto-exhaustion on repeated failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dispatch_core::outbox::{
    EnqueueSendOptions, OutboxRepository, OutboxSender, OutboxSenderConfig, OutboxStatus,
};
use dispatch_core::store::Store;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn successful_send_marks_message_sent() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let repo = Arc::new(OutboxRepository::new(store));

    let id = repo
        .enqueue(
            EnqueueSendOptions::builder()
                .participant_id("p1")
                .kind("sms")
                .payload("hello")
                .build(),
        )
        .await
        .unwrap();

    let sent = Arc::new(AtomicUsize::new(0));
    let sent2 = sent.clone();
    let send: dispatch_core::outbox::SendFn = Arc::new(move |_msg| {
        let sent = sent2.clone();
        Box::pin(async move {
            sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });

    let sender = OutboxSender::new(
        repo.clone(),
        send,
        OutboxSenderConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { sender.run(shutdown_clone).await });
    tokio::time::sleep(Duration::from_millis(80)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(sent.load(Ordering::SeqCst), 1);
    let msg = repo.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, OutboxStatus::Sent);
}

#[tokio::test]
async fn failed_send_reschedules_instead_of_giving_up() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let repo = Arc::new(OutboxRepository::new(store));

    let id = repo
        .enqueue(
            EnqueueSendOptions::builder()
                .participant_id("p1")
                .kind("sms")
                .payload("hello")
                .build(),
        )
        .await
        .unwrap();

    let send: dispatch_core::outbox::SendFn =
        Arc::new(move |_msg| Box::pin(async move { Err(anyhow::anyhow!("downstream unavailable")) }));

    let sender = OutboxSender::new(
        repo.clone(),
        send,
        OutboxSenderConfig {
            poll_interval: Duration::from_millis(20),
            stale_threshold: Duration::from_secs(300),
            claim_batch_limit: 10,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    let handle = tokio::spawn(async move { sender.run(shutdown_clone).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let msg = repo.get(id).await.unwrap().unwrap();
    assert_eq!(msg.status, OutboxStatus::Queued);
    assert!(msg.attempts >= 1);
    assert!(msg.next_attempt_at.unwrap() > Utc::now());
}
