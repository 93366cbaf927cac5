// Ordering and idempotency of the send pipeline.

mod support;

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use relay_server::store::MemoryStore;
use support::{add_device, engine, seed_conversation, FaultInjectingStore};

#[tokio::test]
async fn concurrent_sends_get_gap_free_sequence() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let device = add_device(store.as_ref(), sender, true).await;
    let conversation = seed_conversation(store.as_ref(), &[sender]).await;
    let engine = Arc::new(engine(store));

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .send(
                    sender,
                    device,
                    conversation,
                    Uuid::new_v4(),
                    format!("payload-{}", i),
                )
                .await
                .unwrap()
        }));
    }

    let mut seqs = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(!outcome.duplicate);
        assert!(seqs.insert(outcome.server_seq), "duplicate sequence");
    }

    let expected: HashSet<i64> = (1..=50).collect();
    assert_eq!(seqs, expected);
}

#[tokio::test]
async fn resend_returns_same_sequence_once_stored() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let device = add_device(store.as_ref(), sender, true).await;
    let conversation = seed_conversation(store.as_ref(), &[sender]).await;
    let engine = engine(store.clone());

    let message_uuid = Uuid::new_v4();
    let first = engine
        .send(sender, device, conversation, message_uuid, "hello".into())
        .await
        .unwrap();
    assert!(!first.duplicate);
    assert_eq!(first.server_seq, 1);

    let second = engine
        .send(sender, device, conversation, message_uuid, "hello".into())
        .await
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.server_seq, first.server_seq);

    // Exactly one row, and a later send still gets the next number.
    let stored = engine
        .repair_range(sender, conversation, 1, 10)
        .await
        .unwrap();
    assert_eq!(stored.len(), 1);

    let third = engine
        .send(sender, device, conversation, Uuid::new_v4(), "next".into())
        .await
        .unwrap();
    assert_eq!(third.server_seq, 2);
}

#[tokio::test]
async fn failed_storage_attempt_leaves_no_partial_state() {
    let inner = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let device = add_device(inner.as_ref(), sender, true).await;
    let conversation = seed_conversation(inner.as_ref(), &[sender]).await;

    let store = Arc::new(FaultInjectingStore::failing_sequences(inner.clone(), 1));
    let engine = engine(store);

    // The first attempt dies at the store. Nothing may be left claimed:
    // the retry with the same message_uuid must succeed as a fresh send.
    let message_uuid = Uuid::new_v4();
    let failed = engine
        .send(sender, device, conversation, message_uuid, "hello".into())
        .await;
    assert!(failed.is_err());

    let retry = engine
        .send(sender, device, conversation, message_uuid, "hello".into())
        .await
        .unwrap();
    assert!(!retry.duplicate);
    assert_eq!(retry.server_seq, 1);

    // And once stored, further resends converge on the same number.
    let resend = engine
        .send(sender, device, conversation, message_uuid, "hello".into())
        .await
        .unwrap();
    assert!(resend.duplicate);
    assert_eq!(resend.server_seq, 1);
}

#[tokio::test]
async fn sequences_are_independent_per_conversation() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let device = add_device(store.as_ref(), sender, true).await;
    let conv_a = seed_conversation(store.as_ref(), &[sender]).await;
    let conv_b = seed_conversation(store.as_ref(), &[sender]).await;
    let engine = engine(store);

    for expected in 1..=3 {
        let outcome = engine
            .send(sender, device, conv_a, Uuid::new_v4(), "a".into())
            .await
            .unwrap();
        assert_eq!(outcome.server_seq, expected);
    }

    let outcome = engine
        .send(sender, device, conv_b, Uuid::new_v4(), "b".into())
        .await
        .unwrap();
    assert_eq!(outcome.server_seq, 1);
}

#[tokio::test]
async fn empty_payload_is_rejected_before_any_mutation() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let device = add_device(store.as_ref(), sender, true).await;
    let conversation = seed_conversation(store.as_ref(), &[sender]).await;
    let engine = engine(store);

    let err = engine
        .send(sender, device, conversation, Uuid::new_v4(), String::new())
        .await;
    assert!(err.is_err());

    // The rejected send must not have consumed a sequence number.
    let outcome = engine
        .send(sender, device, conversation, Uuid::new_v4(), "ok".into())
        .await
        .unwrap();
    assert_eq!(outcome.server_seq, 1);
}
