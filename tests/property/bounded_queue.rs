//! Property tests for the bounded outbound queue.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use courier::queue::OutboundQueue;
use courier::storage::memory::MemoryStore;
use courier_proto::message::{ChatId, Message, MessageId, Timestamp, UserId};
use courier_proto::queue::QueueEntry;
use proptest::prelude::*;

fn entry(n: u64) -> QueueEntry {
    let message = Message::compose(
        ChatId::new(format!("chat-{}", n % 3)),
        UserId::new("alice"),
        format!("message {n}"),
        Timestamp::from_millis(1_000 + n),
    )
    .unwrap();
    QueueEntry::new(message, Timestamp::from_millis(1_000 + n))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn holds_at_most_capacity_and_keeps_the_newest(capacity in 1usize..8, count in 0u64..24) {
        let (sent, kept, evicted) = runtime().block_on(async {
            let queue = OutboundQueue::open(MemoryStore::new(), &UserId::new("alice"), capacity).unwrap();
            let mut sent = Vec::new();
            let mut evicted = Vec::new();
            for n in 0..count {
                let e = entry(n);
                sent.push(e.id().clone());
                let receipt = queue.enqueue(e).await.unwrap();
                evicted.extend(receipt.evicted.into_iter().map(|e| e.id().clone()));
            }
            let kept: Vec<MessageId> = queue.all().await.unwrap().iter().map(|e| e.id().clone()).collect();
            (sent, kept, evicted)
        });

        let expected_len = usize::try_from(count).unwrap().min(capacity);
        prop_assert_eq!(kept.len(), expected_len);
        prop_assert_eq!(&kept[..], &sent[sent.len() - expected_len..]);
        // Every entry was either kept or reported as evicted, oldest first.
        prop_assert_eq!(&evicted[..], &sent[..sent.len() - expected_len]);
    }

    #[test]
    fn snapshot_survives_reopen(capacity in 1usize..6, count in 1u64..12) {
        let store = MemoryStore::new();
        let owner = UserId::new("alice");
        let (before, after) = runtime().block_on(async {
            let queue = OutboundQueue::open(store.clone(), &owner, capacity).unwrap();
            for n in 0..count {
                queue.enqueue(entry(n)).await.unwrap();
            }
            let before = queue.all().await.unwrap();
            let reopened = OutboundQueue::open(store.clone(), &owner, capacity).unwrap();
            (before, reopened.all().await.unwrap())
        });
        prop_assert_eq!(before, after);
    }
}
