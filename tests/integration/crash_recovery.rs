//! Integration tests for surviving process death.
//!
//! The outbound queue is written through to storage, so a process killed at
//! any point restarts with every unconfirmed message. Re-sending after an
//! unknown outcome reuses the message ID, and the remote store keeps exactly
//! one document.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;

use courier::config::CourierConfig;
use courier::connectivity::{Interface, Reachability, ReachabilityFeed};
use courier::pipeline::{Courier, StartError, Started};
use courier::queue::QueueError;
use courier::remote::memory::{Fault, MemoryRemote};
use courier::storage::KvStore;
use courier::storage::file::FileStore;
use courier::storage::memory::MemoryStore;
use courier_proto::message::{ChatId, MessageId, UserId};
use courier_proto::status::{DeliveryStatus, FailureReason};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start<S: KvStore>(remote: &MemoryRemote, store: S) -> Started<MemoryRemote> {
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn queued_messages_survive_a_crash() {
    let remote = MemoryRemote::new();
    let store = MemoryStore::new();
    let chat = ChatId::new("general");

    let before = start(&remote, store.clone()).await.courier;
    let mut ids: Vec<MessageId> = Vec::new();
    for text in ["one", "two", "three"] {
        ids.push(before.send_text(&chat, text).await.unwrap().message.id);
    }
    // Killed without running any lifecycle hook.
    drop(before);

    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, store).await;
    let recovered: Vec<MessageId> = courier
        .pending()
        .await
        .unwrap()
        .iter()
        .map(|e| e.id().clone())
        .collect();
    assert_eq!(recovered, ids);
    for id in &ids {
        assert_eq!(courier.status(id), Some(DeliveryStatus::Queued));
    }

    go_online(&courier, &reachability).await;
    courier.drain().await.unwrap();
    assert_eq!(remote.write_order(&chat), ids);
    assert!(courier.pending().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resend_after_unknown_outcome_keeps_one_document() {
    let remote = MemoryRemote::new();
    let store = MemoryStore::new();
    let chat = ChatId::new("general");

    let Started {
        courier: before,
        reachability,
        ..
    } = start(&remote, store.clone()).await;
    go_online(&before, &reachability).await;

    // The write lands remotely but the reply never arrives.
    remote.inject(Fault::CommitThenHang);
    let receipt = before.send_text(&chat, "did it go?").await.unwrap();
    let id = receipt.message.id.clone();
    assert_eq!(receipt.status, DeliveryStatus::Failed(FailureReason::Timeout));
    assert_eq!(remote.document_count(&id), 1);
    drop(before);
    drop(reachability);

    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, store).await;
    assert_eq!(courier.retry_count(&id), Some(1));

    go_online(&courier, &reachability).await;
    courier.drain().await.unwrap();

    assert_eq!(courier.status(&id), Some(DeliveryStatus::Sent));
    assert_eq!(remote.put_attempts(&id), 2);
    assert_eq!(remote.document_count(&id), 1);
    assert_eq!(remote.documents(&chat).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn queue_on_disk_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let remote = MemoryRemote::new();
    let chat = ChatId::new("general");

    let before = start(&remote, FileStore::open(dir.path()).unwrap())
        .await
        .courier;
    let receipt = before.send_text(&chat, "persist me").await.unwrap();
    before.shutdown().await.unwrap();

    let after = start(&remote, FileStore::open(dir.path()).unwrap())
        .await
        .courier;
    let pending = after.pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message, receipt.message);
    assert_eq!(pending[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn corrupt_queue_refuses_to_start() {
    let store = MemoryStore::new();
    store.put_raw("outbox/alice", vec![0xff, 0x00, 0x13, 0x37]);

    let result = Courier::start(
        &CourierConfig::default(),
        UserId::new("alice"),
        store,
        Arc::new(MemoryRemote::new()),
    )
    .await;
    assert!(matches!(
        result,
        Err(StartError::Queue(QueueError::Corrupt(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn queues_are_per_user() {
    let remote = MemoryRemote::new();
    let store = MemoryStore::new();

    let alice = start(&remote, store.clone()).await.courier;
    alice
        .send_text(&ChatId::new("general"), "from alice")
        .await
        .unwrap();
    alice.shutdown().await.unwrap();

    let bob = Courier::start(
        &CourierConfig::default(),
        UserId::new("bob"),
        store,
        Arc::new(remote.clone()),
    )
    .await
    .unwrap()
    .courier;
    assert!(bob.pending().await.unwrap().is_empty());
}
