// ============================================================================
// Store Traits
// ============================================================================
//
// The relay engine's explicit persistence seams: Sequencer, MessageStore,
// DeviceDirectory, MailboxStore, SessionStore, AdmissionStore. Each has one
// production implementation backed by the shared PostgreSQL store; the
// in-memory implementation backs tests and local development.
//
// Concurrency correctness is a property of the implementation's atomicity
// guarantees (atomic upsert-increment, uniqueness constraints), never of the
// callers.
//
// ============================================================================

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{
    AbuseScore, DeliveryStatus, DeviceRecord, MailboxEntry, MessageRecord, NewDevice,
    NewMailboxEntry, NewMessage, NewReceipt, ReceiptRecord, TrustState,
};

/// Outcome of one atomic sequence-and-store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// The message was stored with a freshly assigned position.
    Sequenced {
        server_seq: i64,
        timestamp: DateTime<Utc>,
    },
    /// A row with this (conversation_id, message_uuid) was already stored;
    /// its original position and timestamp are echoed back.
    Duplicate {
        server_seq: i64,
        timestamp: DateTime<Utc>,
    },
}

/// Assigns per-conversation delivery positions. Increment and message insert
/// commit together: a failed attempt rolls back whole and assigns no number,
/// so a stored message always carries a sequence and positions stay gap-free.
#[async_trait::async_trait]
pub trait Sequencer: Send + Sync {
    /// Store the message under the next position, or report the existing
    /// row when the (conversation_id, message_uuid) pair was seen before.
    /// The uniqueness constraint arbitrates concurrent retries.
    async fn sequence_message(&self, message: &NewMessage) -> Result<SequenceOutcome>;
}

/// Ordered message read paths, conversation membership and receipts.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    /// Sequenced messages with `server_seq > since_seq`, ascending, capped.
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>>;

    /// Inclusive ascending slice. Holes are legitimate absences.
    async fn messages_in_range(
        &self,
        conversation_id: Uuid,
        start_seq: i64,
        end_seq: i64,
    ) -> Result<Vec<MessageRecord>>;

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool>;
    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>>;
    async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()>;

    /// Idempotent receipt insert. Returns false when the tuple already
    /// existed.
    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<bool>;

    async fn receipts_after(
        &self,
        conversation_id: Uuid,
        since_receipt_id: i64,
        limit: i64,
    ) -> Result<Vec<ReceiptRecord>>;
}

/// Device registry consulted by fanout and by per-request trust checks.
#[async_trait::async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn insert_device(&self, device: &NewDevice, initial_state: TrustState) -> Result<()>;
    async fn device(&self, device_id: Uuid) -> Result<Option<DeviceRecord>>;
    async fn trust_state(&self, device_id: Uuid) -> Result<Option<TrustState>>;
    async fn trusted_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>>;
    async fn trusted_device_count(&self, user_id: Uuid) -> Result<i64>;
    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>>;

    /// PENDING -> TRUSTED only. Returns false when no pending row matched.
    async fn approve_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool>;

    /// Terminal. Returns false when no row matched.
    async fn revoke_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool>;

    /// Rotate the published pre-key on re-registration.
    async fn update_pre_key(&self, device_id: Uuid, pre_key: &str) -> Result<()>;

    async fn touch_last_seen(&self, device_id: Uuid) -> Result<()>;
}

/// Per-device encrypted copies with delivery status and expiry.
#[async_trait::async_trait]
pub trait MailboxStore: Send + Sync {
    /// Insert exactly once per (device, message). Returns false on repeat.
    async fn insert_entry(&self, entry: &NewMailboxEntry) -> Result<bool>;

    async fn update_status(
        &self,
        recipient_device_id: Uuid,
        message_uuid: Uuid,
        status: DeliveryStatus,
    ) -> Result<bool>;

    /// (device, status, current trust state) for every copy of one message.
    async fn statuses_for_message(
        &self,
        message_uuid: Uuid,
    ) -> Result<Vec<(Uuid, DeliveryStatus, TrustState)>>;

    /// Pending entries for a device, oldest first.
    async fn pending_for_device(&self, device_id: Uuid, limit: i64) -> Result<Vec<MailboxEntry>>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Directional per-device-pair session key material used by the fanout
/// dispatcher.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
    ) -> Result<Option<Vec<u8>>>;

    async fn save_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
        key: &[u8],
    ) -> Result<()>;
}

/// Rate-limit events and abuse scores.
#[async_trait::async_trait]
pub trait AdmissionStore: Send + Sync {
    async fn record_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn count_rate_events(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64>;

    /// Oldest event still inside the window; drives retry-after.
    async fn oldest_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    async fn sweep_rate_events(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Append the event and atomically add its weight to the capped score,
    /// recomputing risk level and, on crossing CRITICAL, the cooldown.
    /// Returns the updated score.
    async fn apply_abuse_event(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        event_type: &str,
        weight: i32,
        now: DateTime<Utc>,
    ) -> Result<AbuseScore>;

    async fn abuse_score(&self, user_id: Uuid) -> Result<Option<AbuseScore>>;

    /// Decay every score untouched for an hour or more. Returns rows changed.
    async fn decay_abuse_scores(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// The full persistence surface the relay engine runs against.
pub trait RelayStore:
    Sequencer + MessageStore + DeviceDirectory + MailboxStore + SessionStore + AdmissionStore
{
}

impl<T> RelayStore for T where
    T: Sequencer + MessageStore + DeviceDirectory + MailboxStore + SessionStore + AdmissionStore
{
}
