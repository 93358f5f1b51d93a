//! Integration tests for app lifecycle hooks.
//!
//! Backgrounding mid-send cancels the in-flight write without spending a
//! retry; foregrounding re-sends it under the same ID. Nothing touches the
//! network while in the background, and hooks after termination are
//! refused.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;
use std::time::Duration;

use courier::config::CourierConfig;
use courier::connectivity::{Interface, Reachability, ReachabilityFeed};
use courier::lifecycle::{LifecycleError, LifecyclePhase};
use courier::pipeline::{Courier, Started};
use courier::remote::RemoteError;
use courier::remote::memory::{Fault, MemoryRemote};
use courier::storage::memory::MemoryStore;
use courier_proto::message::{ChatId, MessageId, UserId};
use courier_proto::status::{DeliveryStatus, FailureReason};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start(remote: &MemoryRemote, store: MemoryStore) -> Started<MemoryRemote> {
    Courier::start(
        &CourierConfig::default(),
        UserId::new("alice"),
        store,
        Arc::new(remote.clone()),
    )
    .await
    .unwrap()
}

async fn go_online(courier: &Courier<MemoryRemote>, feed: &ReachabilityFeed) {
    feed.push(Reachability::Up(Interface::Wifi));
    courier
        .connection()
        .wait_for(|state| state.is_online())
        .await
        .unwrap();
}

async fn wait_for_status(courier: &Courier<MemoryRemote>, id: &MessageId, want: DeliveryStatus) {
    for _ in 0..200 {
        if courier.status(id) == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{id} never reached {want}, last seen {:?}", courier.status(id));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn background_mid_send_then_foreground_delivers_once() {
    let remote = MemoryRemote::new();
    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, MemoryStore::new()).await;
    go_online(&courier, &reachability).await;

    remote.inject(Fault::CommitThenHang);
    let chat = ChatId::new("general");

    let (receipt, background) = tokio::join!(courier.send_text(&chat, "in flight"), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        courier.lifecycle().on_background().await
    });
    let receipt = receipt.unwrap();
    let background = background.unwrap();
    let id = receipt.message.id.clone();

    assert_eq!(receipt.status, DeliveryStatus::Queued);
    assert_eq!(courier.retry_count(&id), Some(0));
    assert_eq!(background.to, LifecyclePhase::Background);
    assert_eq!(background.pending, 1);
    assert!(background.within_budget);
    assert_eq!(remote.document_count(&id), 1);

    let foreground = courier.lifecycle().on_foreground().await.unwrap();
    assert_eq!(foreground.from, LifecyclePhase::Background);
    assert!(foreground.within_budget);

    wait_for_status(&courier, &id, DeliveryStatus::Sent).await;
    assert_eq!(remote.put_attempts(&id), 2);
    assert_eq!(remote.document_count(&id), 1);
    assert!(courier.pending().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn background_cancels_retry_timers() {
    let remote = MemoryRemote::new();
    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, MemoryStore::new()).await;
    go_online(&courier, &reachability).await;

    remote.inject(Fault::Fail(RemoteError::Unavailable("503".into())));
    let chat = ChatId::new("general");
    let receipt = courier.send_text(&chat, "later").await.unwrap();
    let id = receipt.message.id.clone();
    assert_eq!(
        receipt.status,
        DeliveryStatus::Failed(FailureReason::Unavailable)
    );

    courier.lifecycle().on_background().await.unwrap();
    assert_eq!(courier.status(&id), Some(DeliveryStatus::Queued));

    // Long past the backoff: nothing may be attempted while backgrounded.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(remote.put_attempts(&id), 1);
    assert_eq!(courier.status(&id), Some(DeliveryStatus::Queued));

    courier.lifecycle().on_foreground().await.unwrap();
    wait_for_status(&courier, &id, DeliveryStatus::Sent).await;
    assert_eq!(courier.retry_count(&id), Some(1));
}

#[tokio::test(start_paused = true)]
async fn connectivity_returning_in_background_waits_for_foreground() {
    let remote = MemoryRemote::new();
    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, MemoryStore::new()).await;
    let chat = ChatId::new("general");
    let id = courier
        .send_text(&chat, "queued offline")
        .await
        .unwrap()
        .message
        .id;

    courier.lifecycle().on_background().await.unwrap();
    go_online(&courier, &reachability).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(remote.put_attempts(&id), 0);

    let foreground = courier.lifecycle().on_foreground().await.unwrap();
    assert_eq!(courier.lifecycle().phase(), LifecyclePhase::Active);
    assert!(foreground.within_budget);
    wait_for_status(&courier, &id, DeliveryStatus::Sent).await;
}

#[tokio::test(start_paused = true)]
async fn hooks_after_terminate_are_refused() {
    let remote = MemoryRemote::new();
    let store = MemoryStore::new();
    let Started { courier, .. } = start(&remote, store.clone()).await;
    let chat = ChatId::new("general");
    let id = courier
        .send_text(&chat, "left behind")
        .await
        .unwrap()
        .message
        .id;

    let record = courier.lifecycle().on_terminate().await.unwrap();
    assert_eq!(record.to, LifecyclePhase::Terminated);
    assert_eq!(record.pending, 1);

    assert_eq!(
        courier.lifecycle().on_foreground().await,
        Err(LifecycleError::Terminated)
    );
    assert_eq!(
        courier.lifecycle().on_background().await,
        Err(LifecycleError::Terminated)
    );
    assert_eq!(courier.lifecycle().transitions().len(), 1);
    assert!(matches!(
        courier.shutdown().await,
        Err(LifecycleError::Terminated)
    ));

    // The message is still persisted for the next launch.
    let next = start(&remote, store).await.courier;
    assert_eq!(next.pending().await.unwrap()[0].message.id, id);
}

#[tokio::test(start_paused = true)]
async fn transitions_are_recorded_in_order() {
    let remote = MemoryRemote::new();
    let Started { courier, .. } = start(&remote, MemoryStore::new()).await;

    courier.lifecycle().on_background().await.unwrap();
    courier.lifecycle().on_foreground().await.unwrap();
    courier.lifecycle().on_background().await.unwrap();

    let phases: Vec<(LifecyclePhase, LifecyclePhase)> = courier
        .lifecycle()
        .transitions()
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        phases,
        vec![
            (LifecyclePhase::Active, LifecyclePhase::Background),
            (LifecyclePhase::Background, LifecyclePhase::Active),
            (LifecyclePhase::Active, LifecyclePhase::Background),
        ]
    );
    assert!(courier.lifecycle().transitions().iter().all(|t| t.within_budget));
}
