//! Integration tests for the bounded outbound queue.
//!
//! With capacity 3, composing A, B, C, D offline leaves [B, C, D] queued and
//! A abandoned as evicted. Evicted messages can still be retried or
//! discarded by the user.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::future_not_send
)]

use std::sync::Arc;

use futures_util::StreamExt;

use courier::config::CourierConfig;
use courier::connectivity::{Interface, Reachability};
use courier::pipeline::{Courier, Started};
use courier::remote::memory::MemoryRemote;
use courier::storage::memory::MemoryStore;
use courier_proto::message::{ChatId, Message, MessageId, UserId};
use courier_proto::status::{DeliveryStatus, FailureReason};

const EVICTED: DeliveryStatus = DeliveryStatus::Abandoned(FailureReason::Evicted);

async fn start(remote: &MemoryRemote, store: MemoryStore, capacity: usize) -> Started<MemoryRemote> {
    let mut config = CourierConfig::default();
    config.queue.capacity = capacity;
    Courier::start(
        &config,
        UserId::new("alice"),
        store,
        Arc::new(remote.clone()),
    )
    .await
    .unwrap()
}

async fn compose_all(courier: &Courier<MemoryRemote>, chat: &ChatId, texts: &[&str]) -> Vec<Message> {
    let mut out = Vec::new();
    for text in texts {
        out.push(courier.send_text(chat, text).await.unwrap().message);
    }
    out
}

async fn pending_ids(courier: &Courier<MemoryRemote>) -> Vec<MessageId> {
    courier
        .pending()
        .await
        .unwrap()
        .iter()
        .map(|e| e.id().clone())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn oldest_entry_is_evicted_when_full() {
    let remote = MemoryRemote::new();
    let Started { courier, .. } = start(&remote, MemoryStore::new(), 3).await;
    let chat = ChatId::new("general");
    let changes = courier.observe(chat.clone());

    let msgs = compose_all(&courier, &chat, &["A", "B", "C", "D"]).await;

    assert_eq!(
        pending_ids(&courier).await,
        vec![msgs[1].id.clone(), msgs[2].id.clone(), msgs[3].id.clone()]
    );
    assert_eq!(courier.status(&msgs[0].id), Some(EVICTED));
    for m in &msgs[1..] {
        assert_eq!(courier.status(&m.id), Some(DeliveryStatus::Queued));
    }

    let evicted = changes
        .filter(|c| std::future::ready(c.status == EVICTED))
        .next()
        .await
        .unwrap();
    assert_eq!(evicted.message_id, msgs[0].id);
    assert_eq!(evicted.previous, Some(DeliveryStatus::Queued));
}

#[tokio::test(start_paused = true)]
async fn evicted_message_is_never_sent_unless_retried() {
    let remote = MemoryRemote::new();
    let Started {
        courier,
        reachability,
        ..
    } = start(&remote, MemoryStore::new(), 3).await;
    let chat = ChatId::new("general");
    let msgs = compose_all(&courier, &chat, &["A", "B", "C", "D"]).await;

    reachability.push(Reachability::Up(Interface::Wifi));
    courier
        .connection()
        .wait_for(|state| state.is_online())
        .await
        .unwrap();
    courier.drain().await.unwrap();

    assert_eq!(
        remote.write_order(&chat),
        vec![msgs[1].id.clone(), msgs[2].id.clone(), msgs[3].id.clone()]
    );
    assert_eq!(remote.document_count(&msgs[0].id), 0);
    assert_eq!(courier.status(&msgs[0].id), Some(EVICTED));

    courier.retry(&msgs[0]).await.unwrap();
    courier.drain().await.unwrap();
    assert_eq!(courier.status(&msgs[0].id), Some(DeliveryStatus::Sent));
    assert_eq!(remote.document_count(&msgs[0].id), 1);
}

#[tokio::test(start_paused = true)]
async fn retrying_an_evicted_message_evicts_the_next_oldest() {
    let remote = MemoryRemote::new();
    let Started { courier, .. } = start(&remote, MemoryStore::new(), 3).await;
    let chat = ChatId::new("general");
    let msgs = compose_all(&courier, &chat, &["A", "B", "C", "D"]).await;

    assert_eq!(courier.retry(&msgs[0]).await.unwrap(), DeliveryStatus::Queued);

    assert_eq!(
        pending_ids(&courier).await,
        vec![msgs[2].id.clone(), msgs[3].id.clone(), msgs[0].id.clone()]
    );
    assert_eq!(courier.status(&msgs[1].id), Some(EVICTED));
}

#[tokio::test(start_paused = true)]
async fn evicted_message_can_be_discarded() {
    let remote = MemoryRemote::new();
    let Started { courier, .. } = start(&remote, MemoryStore::new(), 1).await;
    let chat = ChatId::new("general");
    let msgs = compose_all(&courier, &chat, &["first", "second"]).await;

    assert_eq!(courier.status(&msgs[0].id), Some(EVICTED));
    courier.discard(&msgs[0].id).await.unwrap();
    assert_eq!(courier.status(&msgs[0].id), None);
    assert_eq!(pending_ids(&courier).await, vec![msgs[1].id.clone()]);

    // Queued messages are not the user's to discard.
    assert!(courier.discard(&msgs[1].id).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn capacity_holds_across_restart() {
    let remote = MemoryRemote::new();
    let store = MemoryStore::new();
    let chat = ChatId::new("general");

    let first = start(&remote, store.clone(), 3).await.courier;
    let msgs = compose_all(&first, &chat, &["A", "B", "C"]).await;
    first.shutdown().await.unwrap();

    let second = start(&remote, store, 3).await.courier;
    let more = compose_all(&second, &chat, &["D"]).await;

    assert_eq!(
        pending_ids(&second).await,
        vec![msgs[1].id.clone(), msgs[2].id.clone(), more[0].id.clone()]
    );
    assert_eq!(second.status(&msgs[0].id), Some(EVICTED));
}
