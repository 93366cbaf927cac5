// Multi-device fanout, the revoke race, receipts and inbox drain.

mod support;

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use relay_server::relay::UserDeliveryState;
use relay_server::store::{DeviceDirectory, MailboxStore, MemoryStore};
use relay_server::types::ReceiptType;
use support::{add_device, engine, link_session, seed_conversation, FaultInjectingStore};

#[tokio::test]
async fn fanout_covers_trusted_devices_only() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let mut recipient_devices = Vec::new();
    for _ in 0..3 {
        let d = add_device(store.as_ref(), recipient, true).await;
        link_session(store.as_ref(), sender_device, d).await;
        recipient_devices.push(d);
    }
    let revoked = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, revoked).await;
    store.revoke_device(recipient, revoked).await.unwrap();

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());

    let message_uuid = Uuid::new_v4();
    engine
        .send(sender, sender_device, conversation, message_uuid, "m".into())
        .await
        .unwrap();

    for d in &recipient_devices {
        let pending = store.pending_for_device(*d, 10).await.unwrap();
        assert_eq!(pending.len(), 1, "trusted device missing its copy");
    }
    let pending = store.pending_for_device(revoked, 10).await.unwrap();
    assert!(pending.is_empty(), "revoked device must not get a copy");
}

#[tokio::test]
async fn device_revoked_mid_fanout_is_dropped_at_recheck() {
    let inner = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(inner.as_ref(), sender, true).await;
    let kept = add_device(inner.as_ref(), recipient, true).await;
    let racing = add_device(inner.as_ref(), recipient, true).await;
    link_session(inner.as_ref(), sender_device, kept).await;
    link_session(inner.as_ref(), sender_device, racing).await;

    // Capture the snapshot while both devices are trusted, then revoke one.
    // Fanout works from the stale snapshot, as if revocation landed after
    // its device listing but before its mailbox write.
    let snapshot = inner.trusted_devices(recipient).await.unwrap();
    assert_eq!(snapshot.len(), 2);
    inner.revoke_device(recipient, racing).await.unwrap();

    let store = Arc::new(FaultInjectingStore::with_stale_snapshot(
        inner.clone(),
        snapshot,
    ));
    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store);

    let message_uuid = Uuid::new_v4();
    engine
        .send(sender, sender_device, conversation, message_uuid, "m".into())
        .await
        .unwrap();

    assert_eq!(inner.pending_for_device(kept, 10).await.unwrap().len(), 1);
    assert!(inner.pending_for_device(racing, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn device_without_session_is_skipped_not_failed() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let linked = add_device(store.as_ref(), recipient, true).await;
    let unlinked = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, linked).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());

    let outcome = engine
        .send(sender, sender_device, conversation, Uuid::new_v4(), "m".into())
        .await
        .unwrap();
    assert_eq!(outcome.server_seq, 1);

    assert_eq!(store.pending_for_device(linked, 10).await.unwrap().len(), 1);
    assert!(store
        .pending_for_device(unlinked, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn recipient_with_no_trusted_devices_does_not_fail_send() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    add_device(store.as_ref(), recipient, false).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store);

    let outcome = engine
        .send(sender, sender_device, conversation, Uuid::new_v4(), "m".into())
        .await
        .unwrap();
    assert_eq!(outcome.server_seq, 1);
}

#[tokio::test]
async fn mailbox_copies_are_sealed_per_device() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let a = add_device(store.as_ref(), recipient, true).await;
    let b = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, a).await;
    link_session(store.as_ref(), sender_device, b).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());
    engine
        .send(sender, sender_device, conversation, Uuid::new_v4(), "m".into())
        .await
        .unwrap();

    let copy_a = &store.pending_for_device(a, 10).await.unwrap()[0];
    let copy_b = &store.pending_for_device(b, 10).await.unwrap()[0];
    assert_ne!(copy_a.sealed_payload, copy_b.sealed_payload);
    assert_ne!(copy_a.nonce, copy_b.nonce);
    assert_ne!(copy_a.sealed_payload, "m");
}

#[tokio::test]
async fn receipts_are_idempotent_and_advance_delivery_state() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let recipient_device = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, recipient_device).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());

    let message_uuid = Uuid::new_v4();
    engine
        .send(sender, sender_device, conversation, message_uuid, "m".into())
        .await
        .unwrap();

    let first = engine
        .submit_receipt(
            recipient,
            recipient_device,
            conversation,
            message_uuid,
            ReceiptType::Delivered,
        )
        .await
        .unwrap();
    assert!(first.newly_created);
    assert_eq!(first.delivery_state, UserDeliveryState::Delivered);

    // Same receipt again: success, nothing new recorded.
    let second = engine
        .submit_receipt(
            recipient,
            recipient_device,
            conversation,
            message_uuid,
            ReceiptType::Delivered,
        )
        .await
        .unwrap();
    assert!(!second.newly_created);

    let read = engine
        .submit_receipt(
            recipient,
            recipient_device,
            conversation,
            message_uuid,
            ReceiptType::Read,
        )
        .await
        .unwrap();
    assert!(read.newly_created);
    assert_eq!(read.delivery_state, UserDeliveryState::Read);

    // Receipts surface through pull for the sender.
    let page = engine.pull(sender, conversation, 0, 0, None).await.unwrap();
    assert_eq!(page.receipts.len(), 2);
    assert!(page.last_receipt_id > 0);
}

#[tokio::test]
async fn revoked_device_cannot_hold_the_delivery_indicator() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let reader = add_device(store.as_ref(), recipient, true).await;
    let other = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, reader).await;
    link_session(store.as_ref(), sender_device, other).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());

    let message_uuid = Uuid::new_v4();
    engine
        .send(sender, sender_device, conversation, message_uuid, "m".into())
        .await
        .unwrap();

    let read = engine
        .submit_receipt(recipient, reader, conversation, message_uuid, ReceiptType::Read)
        .await
        .unwrap();
    assert_eq!(read.delivery_state, UserDeliveryState::Read);

    // Revoking the reading device takes its READ out of the aggregation;
    // only the still-trusted pending device counts afterwards.
    store.revoke_device(recipient, reader).await.unwrap();
    let state = engine
        .dispatcher()
        .delivery_state(message_uuid)
        .await
        .unwrap();
    assert_eq!(state, UserDeliveryState::Sent);
}

#[tokio::test]
async fn inbox_drain_marks_entries_delivered() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let recipient_device = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, recipient_device).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());

    for _ in 0..3 {
        engine
            .send(sender, sender_device, conversation, Uuid::new_v4(), "m".into())
            .await
            .unwrap();
    }

    let drained = engine.drain_inbox(recipient_device, None).await.unwrap();
    assert_eq!(drained.len(), 3);

    // Already handed out: a second drain is empty.
    let again = engine.drain_inbox(recipient_device, None).await.unwrap();
    assert!(again.is_empty());

    let statuses = store
        .statuses_for_message(drained[0].message_uuid)
        .await
        .unwrap();
    assert!(statuses
        .iter()
        .any(|(d, s, _)| *d == recipient_device
            && *s == relay_server::types::DeliveryStatus::Delivered));
}

#[tokio::test]
async fn expired_mailbox_entries_are_purged() {
    let store = Arc::new(MemoryStore::new());
    let sender = Uuid::new_v4();
    let recipient = Uuid::new_v4();

    let sender_device = add_device(store.as_ref(), sender, true).await;
    let recipient_device = add_device(store.as_ref(), recipient, true).await;
    link_session(store.as_ref(), sender_device, recipient_device).await;

    let conversation = seed_conversation(store.as_ref(), &[sender, recipient]).await;
    let engine = engine(store.clone());
    engine
        .send(sender, sender_device, conversation, Uuid::new_v4(), "m".into())
        .await
        .unwrap();

    // Nothing expires yet.
    assert_eq!(store.purge_expired(Utc::now()).await.unwrap(), 0);

    // Far enough in the future everything is past its TTL.
    let later = Utc::now() + chrono::Duration::days(31);
    assert_eq!(store.purge_expired(later).await.unwrap(), 1);
    assert!(store
        .pending_for_device(recipient_device, 10)
        .await
        .unwrap()
        .is_empty());
}
