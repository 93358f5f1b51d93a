//! Integration tests for retry with exponential backoff.
//!
//! A message whose writes keep timing out is retried after 2 s and 4 s,
//! then abandoned on the third failure and removed from the queue. A manual
//! retry starts over with a fresh retry budget.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;

use courier::config::CourierConfig;
use courier::connectivity::{Interface, Reachability, ReachabilityFeed};
use courier::pipeline::{Courier, CourierError, Started};
use courier::remote::RemoteError;
use courier::remote::memory::{Fault, MemoryRemote};
use courier::storage::memory::MemoryStore;
use courier_proto::message::{ChatId, UserId};
use courier_proto::status::{DeliveryStatus, FailureReason};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_online(remote: &MemoryRemote) -> (Courier<MemoryRemote>, ReachabilityFeed) {
    let Started {
        courier,
        reachability,
        ..
    } = Courier::start(
        &CourierConfig::default(),
        UserId::new("alice"),
        MemoryStore::new(),
        Arc::new(remote.clone()),
    )
    .await
    .unwrap();

    reachability.push(Reachability::Up(Interface::Wifi));
    courier
        .connection()
        .wait_for(|state| state.is_online())
        .await
        .unwrap();
    (courier, reachability)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn three_timeouts_abandon_the_message() {
    let remote = MemoryRemote::new();
    let (courier, _feed) = start_online(&remote).await;
    for _ in 0..3 {
        remote.inject(Fault::Hang);
    }

    let chat = ChatId::new("general");
    let mut changes = courier.observe(chat.clone());
    let started = Instant::now();

    let receipt = courier.send_text(&chat, "are you there?").await.unwrap();
    let id = receipt.message.id.clone();
    assert_eq!(receipt.status, DeliveryStatus::Failed(FailureReason::Timeout));

    let mut seen = Vec::new();
    let collect = async {
        while let Some(change) = changes.next().await {
            assert_eq!(change.message_id, id);
            seen.push((change.status, change.retry_count));
            if matches!(change.status, DeliveryStatus::Abandoned(_)) {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(300), collect)
        .await
        .unwrap();

    let timeout = DeliveryStatus::Failed(FailureReason::Timeout);
    assert_eq!(
        seen,
        vec![
            (DeliveryStatus::Queued, 0),
            (DeliveryStatus::Sending, 0),
            (timeout, 1),
            (DeliveryStatus::Queued, 1),
            (DeliveryStatus::Sending, 1),
            (timeout, 2),
            (DeliveryStatus::Queued, 2),
            (DeliveryStatus::Sending, 2),
            (DeliveryStatus::Abandoned(FailureReason::Timeout), 3),
        ]
    );

    // Three 10 s write timeouts plus the 2 s and 4 s backoff waits.
    assert!(started.elapsed() >= Duration::from_secs(36));
    assert_eq!(remote.put_attempts(&id), 3);
    assert!(remote.documents(&chat).is_empty());
    assert!(courier.pending().await.unwrap().is_empty());
    assert_eq!(courier.retry_count(&id), Some(3));
}

#[tokio::test(start_paused = true)]
async fn manual_retry_resets_the_budget_and_delivers() {
    let remote = MemoryRemote::new();
    let (courier, _feed) = start_online(&remote).await;
    remote.inject(Fault::Fail(RemoteError::PermissionDenied("rules".into())));

    let chat = ChatId::new("general");
    let receipt = courier.send_text(&chat, "let me in").await.unwrap();
    let id = receipt.message.id.clone();
    assert_eq!(
        receipt.status,
        DeliveryStatus::Abandoned(FailureReason::PermissionDenied)
    );
    assert_eq!(remote.put_attempts(&id), 1);
    assert!(courier.pending().await.unwrap().is_empty());

    assert_eq!(
        courier.retry(&receipt.message).await.unwrap(),
        DeliveryStatus::Queued
    );
    assert_eq!(courier.retry_count(&id), Some(0));
    courier.drain().await.unwrap();

    assert_eq!(courier.status(&id), Some(DeliveryStatus::Sent));
    assert_eq!(remote.document_count(&id), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_recovers_on_the_next_attempt() {
    let remote = MemoryRemote::new();
    let (courier, _feed) = start_online(&remote).await;
    remote.inject(Fault::Fail(RemoteError::Unavailable("503".into())));

    let chat = ChatId::new("general");
    let receipt = courier.send_text(&chat, "flaky").await.unwrap();
    let id = receipt.message.id.clone();
    assert_eq!(
        receipt.status,
        DeliveryStatus::Failed(FailureReason::Unavailable)
    );
    assert_eq!(courier.pending().await.unwrap()[0].retry_count, 1);

    // Backoff after the first failure is 2 s.
    tokio::time::sleep(Duration::from_millis(1900)).await;
    assert_eq!(remote.put_attempts(&id), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    courier.drain().await.unwrap();

    assert_eq!(courier.status(&id), Some(DeliveryStatus::Sent));
    assert_eq!(remote.put_attempts(&id), 2);
    assert_eq!(remote.document_count(&id), 1);
    assert!(courier.pending().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandoned_message_can_be_discarded() {
    let remote = MemoryRemote::new();
    let (courier, _feed) = start_online(&remote).await;
    remote.inject(Fault::Fail(RemoteError::InvalidArgument("bad field".into())));

    let receipt = courier
        .send_text(&ChatId::new("general"), "malformed")
        .await
        .unwrap();
    let id = receipt.message.id;
    assert_eq!(
        courier.status(&id),
        Some(DeliveryStatus::Abandoned(FailureReason::InvalidArgument))
    );

    courier.discard(&id).await.unwrap();
    assert_eq!(courier.status(&id), None);
    assert!(matches!(
        courier.discard(&id).await,
        Err(CourierError::Tracker(_))
    ));
}
