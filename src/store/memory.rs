// ============================================================================
// In-Memory Store
// ============================================================================
//
// Single-mutex implementation of the store traits. Backs the integration
// tests and local development without a PostgreSQL instance; the mutex gives
// the same observable atomicity the production store gets from its
// upsert-increment and uniqueness constraints.
//
// ============================================================================

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::admission::abuse::risk_level_for;
use crate::config::{ABUSE_COOLDOWN_SECS, ABUSE_DECAY_PER_HOUR, ABUSE_SCORE_CAP,
    ABUSE_THRESHOLD_CRITICAL};
use crate::relay::crypto::session_id;
use crate::store::{
    AdmissionStore, DeviceDirectory, MailboxStore, MessageStore, Sequencer, SequenceOutcome,
    SessionStore,
};
use crate::types::{
    AbuseScore, DeliveryStatus, DeviceRecord, MailboxEntry, MessageRecord, NewDevice,
    NewMailboxEntry, NewMessage, NewReceipt, ReceiptRecord, TrustState,
};

#[derive(Default)]
struct Inner {
    sequences: HashMap<Uuid, i64>,
    messages: HashMap<(Uuid, Uuid), MessageRecord>,
    members: HashMap<Uuid, BTreeSet<Uuid>>,
    receipts: Vec<ReceiptRecord>,
    receipt_keys: HashSet<(Uuid, Uuid, &'static str, Uuid)>,
    next_receipt_id: i64,
    devices: HashMap<Uuid, DeviceRecord>,
    sessions: HashMap<String, Vec<u8>>,
    mailbox: HashMap<(Uuid, Uuid), MailboxEntry>,
    rate_events: Vec<(String, String, DateTime<Utc>)>,
    abuse_scores: HashMap<Uuid, AbuseScore>,
    abuse_events: Vec<(Uuid, Option<Uuid>, String, i32, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a test already panicked; propagate the data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Sequencer for MemoryStore {
    async fn sequence_message(&self, message: &NewMessage) -> Result<SequenceOutcome> {
        // Increment and insert happen under one lock acquisition, so a
        // stored message always carries its sequence.
        let mut inner = self.lock();
        let key = (message.conversation_id, message.message_uuid);
        if let Some(existing) = inner.messages.get(&key) {
            return Ok(SequenceOutcome::Duplicate {
                server_seq: existing.server_seq,
                timestamp: existing.created_at,
            });
        }

        let seq = inner.sequences.entry(message.conversation_id).or_insert(0);
        *seq += 1;
        let server_seq = *seq;

        let timestamp = Utc::now();
        inner.messages.insert(
            key,
            MessageRecord {
                conversation_id: message.conversation_id,
                message_uuid: message.message_uuid,
                sender_id: message.sender_id,
                sender_device: message.sender_device,
                server_seq,
                encrypted_payload: message.encrypted_payload.clone(),
                created_at: timestamp,
            },
        );
        Ok(SequenceOutcome::Sequenced {
            server_seq,
            timestamp,
        })
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let inner = self.lock();
        let mut out: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && m.server_seq > since_seq)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.server_seq);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn messages_in_range(
        &self,
        conversation_id: Uuid,
        start_seq: i64,
        end_seq: i64,
    ) -> Result<Vec<MessageRecord>> {
        let inner = self.lock();
        let mut out: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.server_seq >= start_seq
                    && m.server_seq <= end_seq
            })
            .cloned()
            .collect();
        out.sort_by_key(|m| m.server_seq);
        Ok(out)
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let inner = self.lock();
        Ok(inner
            .members
            .get(&conversation_id)
            .map(|m| m.contains(&user_id))
            .unwrap_or(false))
    }

    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let inner = self.lock();
        Ok(inner
            .members
            .get(&conversation_id)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        inner
            .members
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
        Ok(())
    }

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<bool> {
        let mut inner = self.lock();
        let key = (
            receipt.conversation_id,
            receipt.message_uuid,
            receipt.receipt_type.as_str(),
            receipt.sender_device,
        );
        if !inner.receipt_keys.insert(key) {
            return Ok(false);
        }
        inner.next_receipt_id += 1;
        let receipt_id = inner.next_receipt_id;
        inner.receipts.push(ReceiptRecord {
            receipt_id,
            conversation_id: receipt.conversation_id,
            message_uuid: receipt.message_uuid,
            receipt_type: receipt.receipt_type,
            user_id: receipt.user_id,
            sender_device: receipt.sender_device,
            created_at: Utc::now(),
        });
        Ok(true)
    }

    async fn receipts_after(
        &self,
        conversation_id: Uuid,
        since_receipt_id: i64,
        limit: i64,
    ) -> Result<Vec<ReceiptRecord>> {
        let inner = self.lock();
        let mut out: Vec<ReceiptRecord> = inner
            .receipts
            .iter()
            .filter(|r| r.conversation_id == conversation_id && r.receipt_id > since_receipt_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.receipt_id);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for MemoryStore {
    async fn insert_device(&self, device: &NewDevice, initial_state: TrustState) -> Result<()> {
        let mut inner = self.lock();
        inner.devices.insert(
            device.device_id,
            DeviceRecord {
                device_id: device.device_id,
                user_id: device.user_id,
                platform: device.platform.clone(),
                public_identity_key: device.public_identity_key.clone(),
                public_pre_key: device.public_pre_key.clone(),
                trust_state: initial_state,
                created_at: Utc::now(),
                last_seen_at: None,
                revoked_at: None,
            },
        );
        Ok(())
    }

    async fn device(&self, device_id: Uuid) -> Result<Option<DeviceRecord>> {
        let inner = self.lock();
        Ok(inner.devices.get(&device_id).cloned())
    }

    async fn trust_state(&self, device_id: Uuid) -> Result<Option<TrustState>> {
        let inner = self.lock();
        Ok(inner.devices.get(&device_id).map(|d| d.trust_state))
    }

    async fn trusted_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let inner = self.lock();
        let mut out: Vec<DeviceRecord> = inner
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.trust_state == TrustState::Trusted)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.device_id);
        Ok(out)
    }

    async fn trusted_device_count(&self, user_id: Uuid) -> Result<i64> {
        let inner = self.lock();
        Ok(inner
            .devices
            .values()
            .filter(|d| d.user_id == user_id && d.trust_state == TrustState::Trusted)
            .count() as i64)
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let inner = self.lock();
        let mut out: Vec<DeviceRecord> = inner
            .devices
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }

    async fn approve_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner.devices.get_mut(&device_id) {
            Some(d) if d.user_id == user_id && d.trust_state == TrustState::Pending => {
                d.trust_state = TrustState::Trusted;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        let mut inner = self.lock();
        match inner.devices.get_mut(&device_id) {
            Some(d) if d.user_id == user_id => {
                d.trust_state = TrustState::Revoked;
                d.revoked_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_pre_key(&self, device_id: Uuid, pre_key: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(d) = inner.devices.get_mut(&device_id) {
            d.public_pre_key = pre_key.to_string();
            d.last_seen_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_last_seen(&self, device_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        if let Some(d) = inner.devices.get_mut(&device_id) {
            d.last_seen_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MailboxStore for MemoryStore {
    async fn insert_entry(&self, entry: &NewMailboxEntry) -> Result<bool> {
        let mut inner = self.lock();
        let key = (entry.recipient_device_id, entry.message_uuid);
        if inner.mailbox.contains_key(&key) {
            return Ok(false);
        }
        inner.mailbox.insert(
            key,
            MailboxEntry {
                recipient_device_id: entry.recipient_device_id,
                message_uuid: entry.message_uuid,
                sealed_payload: entry.sealed_payload.clone(),
                nonce: entry.nonce.clone(),
                status: DeliveryStatus::Pending,
                expires_at: entry.expires_at,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn update_status(
        &self,
        recipient_device_id: Uuid,
        message_uuid: Uuid,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let mut inner = self.lock();
        match inner.mailbox.get_mut(&(recipient_device_id, message_uuid)) {
            Some(entry) => {
                entry.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn statuses_for_message(
        &self,
        message_uuid: Uuid,
    ) -> Result<Vec<(Uuid, DeliveryStatus, TrustState)>> {
        let inner = self.lock();
        Ok(inner
            .mailbox
            .values()
            .filter(|e| e.message_uuid == message_uuid)
            .map(|e| {
                let trust = inner
                    .devices
                    .get(&e.recipient_device_id)
                    .map(|d| d.trust_state)
                    .unwrap_or(TrustState::Revoked);
                (e.recipient_device_id, e.status, trust)
            })
            .collect())
    }

    async fn pending_for_device(&self, device_id: Uuid, limit: i64) -> Result<Vec<MailboxEntry>> {
        let inner = self.lock();
        let mut out: Vec<MailboxEntry> = inner
            .mailbox
            .values()
            .filter(|e| e.recipient_device_id == device_id && e.status == DeliveryStatus::Pending)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.mailbox.len();
        inner.mailbox.retain(|_, e| e.expires_at > now);
        Ok((before - inner.mailbox.len()) as u64)
    }
}

#[async_trait::async_trait]
impl SessionStore for MemoryStore {
    async fn load_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
    ) -> Result<Option<Vec<u8>>> {
        let inner = self.lock();
        Ok(inner
            .sessions
            .get(&session_id(sender_device, recipient_device))
            .cloned())
    }

    async fn save_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
        key: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock();
        inner
            .sessions
            .insert(session_id(sender_device, recipient_device), key.to_vec());
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdmissionStore for MemoryStore {
    async fn record_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner
            .rate_events
            .push((identifier.to_string(), endpoint.to_string(), at));
        Ok(())
    }

    async fn count_rate_events(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64> {
        let inner = self.lock();
        Ok(inner
            .rate_events
            .iter()
            .filter(|(i, e, at)| i == identifier && e == endpoint && *at >= window_start)
            .count() as i64)
    }

    async fn oldest_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.lock();
        Ok(inner
            .rate_events
            .iter()
            .filter(|(i, e, at)| i == identifier && e == endpoint && *at >= window_start)
            .map(|(_, _, at)| *at)
            .min())
    }

    async fn sweep_rate_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let before = inner.rate_events.len();
        inner.rate_events.retain(|(_, _, at)| *at >= cutoff);
        Ok((before - inner.rate_events.len()) as u64)
    }

    async fn apply_abuse_event(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        event_type: &str,
        weight: i32,
        now: DateTime<Utc>,
    ) -> Result<AbuseScore> {
        let mut inner = self.lock();
        inner
            .abuse_events
            .push((user_id, device_id, event_type.to_string(), weight, now));

        let entry = inner
            .abuse_scores
            .entry(user_id)
            .or_insert_with(|| AbuseScore::clean(user_id));
        entry.score = (entry.score + weight).min(ABUSE_SCORE_CAP).max(0);
        entry.risk_level = risk_level_for(entry.score);
        entry.last_updated = now;
        if entry.score >= ABUSE_THRESHOLD_CRITICAL {
            entry.cooldown_until = Some(now + Duration::seconds(ABUSE_COOLDOWN_SECS));
        }
        Ok(entry.clone())
    }

    async fn abuse_score(&self, user_id: Uuid) -> Result<Option<AbuseScore>> {
        let inner = self.lock();
        Ok(inner.abuse_scores.get(&user_id).cloned())
    }

    async fn decay_abuse_scores(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock();
        let cutoff = now - Duration::hours(1);
        let mut changed = 0;
        for score in inner.abuse_scores.values_mut() {
            if score.last_updated <= cutoff && score.score > 0 {
                score.score = (score.score - ABUSE_DECAY_PER_HOUR).max(0);
                score.risk_level = risk_level_for(score.score);
                changed += 1;
            }
        }
        Ok(changed)
    }
}
