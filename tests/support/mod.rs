#![allow(dead_code)]

// Shared helpers for the integration tests: an engine over the in-memory
// store, device/session seeding, and a delegating store wrapper with fault
// knobs for the revoke/fanout race and for storage failures mid-send.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use relay_server::push::NoopWakeGateway;
use relay_server::relay::RelayEngine;
use relay_server::store::{
    AdmissionStore, DeviceDirectory, MailboxStore, MemoryStore, MessageStore, RelayStore,
    Sequencer, SequenceOutcome, SessionStore,
};
use relay_server::types::{
    AbuseScore, DeliveryStatus, DeviceRecord, MailboxEntry, MessageRecord, NewDevice,
    NewMailboxEntry, NewMessage, NewReceipt, ReceiptRecord, TrustState,
};

pub const SESSION_KEY: [u8; 32] = [42u8; 32];

pub fn engine(store: Arc<dyn RelayStore>) -> RelayEngine {
    RelayEngine::new(store, Arc::new(NoopWakeGateway))
}

pub async fn add_device(store: &dyn RelayStore, user_id: Uuid, trusted: bool) -> Uuid {
    let device_id = Uuid::new_v4();
    let state = if trusted {
        TrustState::Trusted
    } else {
        TrustState::Pending
    };
    store
        .insert_device(
            &NewDevice {
                device_id,
                user_id,
                platform: "ios".into(),
                public_identity_key: "ik".into(),
                public_pre_key: "pk".into(),
            },
            state,
        )
        .await
        .unwrap();
    device_id
}

pub async fn link_session(store: &dyn RelayStore, sender_device: Uuid, recipient_device: Uuid) {
    store
        .save_session_key(sender_device, recipient_device, &SESSION_KEY)
        .await
        .unwrap();
}

pub async fn seed_conversation(store: &dyn RelayStore, members: &[Uuid]) -> Uuid {
    let conversation_id = Uuid::new_v4();
    for member in members {
        store.add_member(conversation_id, *member).await.unwrap();
    }
    conversation_id
}

/// Delegates everything to the wrapped store, with two fault knobs:
/// an optional stale trusted-device snapshot (fanout sees a device revoked
/// after the snapshot and must drop it at the trust re-check) and a count
/// of sequencing attempts to fail before delegating.
pub struct FaultInjectingStore {
    inner: Arc<MemoryStore>,
    snapshot: Option<Vec<DeviceRecord>>,
    sequence_failures: AtomicU32,
}

impl FaultInjectingStore {
    pub fn with_stale_snapshot(inner: Arc<MemoryStore>, snapshot: Vec<DeviceRecord>) -> Self {
        Self {
            inner,
            snapshot: Some(snapshot),
            sequence_failures: AtomicU32::new(0),
        }
    }

    pub fn failing_sequences(inner: Arc<MemoryStore>, failures: u32) -> Self {
        Self {
            inner,
            snapshot: None,
            sequence_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait::async_trait]
impl Sequencer for FaultInjectingStore {
    async fn sequence_message(&self, message: &NewMessage) -> Result<SequenceOutcome> {
        let armed = self
            .sequence_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            anyhow::bail!("injected storage failure");
        }
        self.inner.sequence_message(message).await
    }
}

#[async_trait::async_trait]
impl MessageStore for FaultInjectingStore {
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        self.inner
            .messages_after(conversation_id, since_seq, limit)
            .await
    }

    async fn messages_in_range(
        &self,
        conversation_id: Uuid,
        start_seq: i64,
        end_seq: i64,
    ) -> Result<Vec<MessageRecord>> {
        self.inner
            .messages_in_range(conversation_id, start_seq, end_seq)
            .await
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.inner.is_member(conversation_id, user_id).await
    }

    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        self.inner.members(conversation_id).await
    }

    async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        self.inner.add_member(conversation_id, user_id).await
    }

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<bool> {
        self.inner.insert_receipt(receipt).await
    }

    async fn receipts_after(
        &self,
        conversation_id: Uuid,
        since_receipt_id: i64,
        limit: i64,
    ) -> Result<Vec<ReceiptRecord>> {
        self.inner
            .receipts_after(conversation_id, since_receipt_id, limit)
            .await
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for FaultInjectingStore {
    async fn insert_device(&self, device: &NewDevice, initial_state: TrustState) -> Result<()> {
        self.inner.insert_device(device, initial_state).await
    }

    async fn device(&self, device_id: Uuid) -> Result<Option<DeviceRecord>> {
        self.inner.device(device_id).await
    }

    async fn trust_state(&self, device_id: Uuid) -> Result<Option<TrustState>> {
        self.inner.trust_state(device_id).await
    }

    async fn trusted_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        match &self.snapshot {
            Some(snapshot) => Ok(snapshot.clone()),
            None => self.inner.trusted_devices(user_id).await,
        }
    }

    async fn trusted_device_count(&self, user_id: Uuid) -> Result<i64> {
        self.inner.trusted_device_count(user_id).await
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        self.inner.devices_for_user(user_id).await
    }

    async fn approve_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        self.inner.approve_device(user_id, device_id).await
    }

    async fn revoke_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        self.inner.revoke_device(user_id, device_id).await
    }

    async fn update_pre_key(&self, device_id: Uuid, pre_key: &str) -> Result<()> {
        self.inner.update_pre_key(device_id, pre_key).await
    }

    async fn touch_last_seen(&self, device_id: Uuid) -> Result<()> {
        self.inner.touch_last_seen(device_id).await
    }
}

#[async_trait::async_trait]
impl MailboxStore for FaultInjectingStore {
    async fn insert_entry(&self, entry: &NewMailboxEntry) -> Result<bool> {
        self.inner.insert_entry(entry).await
    }

    async fn update_status(
        &self,
        recipient_device_id: Uuid,
        message_uuid: Uuid,
        status: DeliveryStatus,
    ) -> Result<bool> {
        self.inner
            .update_status(recipient_device_id, message_uuid, status)
            .await
    }

    async fn statuses_for_message(
        &self,
        message_uuid: Uuid,
    ) -> Result<Vec<(Uuid, DeliveryStatus, TrustState)>> {
        self.inner.statuses_for_message(message_uuid).await
    }

    async fn pending_for_device(&self, device_id: Uuid, limit: i64) -> Result<Vec<MailboxEntry>> {
        self.inner.pending_for_device(device_id, limit).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.purge_expired(now).await
    }
}

#[async_trait::async_trait]
impl SessionStore for FaultInjectingStore {
    async fn load_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
    ) -> Result<Option<Vec<u8>>> {
        self.inner
            .load_session_key(sender_device, recipient_device)
            .await
    }

    async fn save_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
        key: &[u8],
    ) -> Result<()> {
        self.inner
            .save_session_key(sender_device, recipient_device, key)
            .await
    }
}

#[async_trait::async_trait]
impl AdmissionStore for FaultInjectingStore {
    async fn record_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.record_rate_event(identifier, endpoint, at).await
    }

    async fn count_rate_events(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64> {
        self.inner
            .count_rate_events(identifier, endpoint, window_start)
            .await
    }

    async fn oldest_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner
            .oldest_rate_event(identifier, endpoint, window_start)
            .await
    }

    async fn sweep_rate_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.inner.sweep_rate_events(cutoff).await
    }

    async fn apply_abuse_event(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        event_type: &str,
        weight: i32,
        now: DateTime<Utc>,
    ) -> Result<AbuseScore> {
        self.inner
            .apply_abuse_event(user_id, device_id, event_type, weight, now)
            .await
    }

    async fn abuse_score(&self, user_id: Uuid) -> Result<Option<AbuseScore>> {
        self.inner.abuse_score(user_id).await
    }

    async fn decay_abuse_scores(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.decay_abuse_scores(now).await
    }
}
