// ============================================================================
// Domain Types
// ============================================================================
//
// Shared records for the relay engine:
// - MessageRecord: one accepted send, owned by its conversation
// - DeviceRecord / TrustState: device directory entries
// - MailboxEntry / DeliveryStatus: per-device encrypted copies
// - ReceiptRecord / ReceiptType: idempotent delivery/read receipts
// - AbuseScore / RiskLevel: admission control state
//
// ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An accepted message. Sequencing and storage commit together, so a stored
/// row always carries its position; `server_seq` is immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    pub sender_id: Uuid,
    pub sender_device: Uuid,
    pub server_seq: i64,
    pub encrypted_payload: String,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the client for a new send, before sequencing.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    pub sender_id: Uuid,
    pub sender_device: Uuid,
    pub encrypted_payload: String,
}

/// Device trust lifecycle. REVOKED is terminal: a device id never returns
/// to TRUSTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustState {
    Pending,
    Trusted,
    Revoked,
}

impl TrustState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustState::Pending => "PENDING",
            TrustState::Trusted => "TRUSTED",
            TrustState::Revoked => "REVOKED",
        }
    }

    pub fn parse(s: &str) -> Option<TrustState> {
        match s {
            "PENDING" => Some(TrustState::Pending),
            "TRUSTED" => Some(TrustState::Trusted),
            "REVOKED" => Some(TrustState::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub public_identity_key: String,
    pub public_pre_key: String,
    pub trust_state: TrustState,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub platform: String,
    pub public_identity_key: String,
    pub public_pre_key: String,
}

/// Per-device delivery progression. PENDING -> DELIVERED (pulled) ->
/// ACKED (processed) -> READ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acked,
    Read,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "PENDING",
            DeliveryStatus::Delivered => "DELIVERED",
            DeliveryStatus::Acked => "ACKED",
            DeliveryStatus::Read => "READ",
        }
    }

    pub fn parse(s: &str) -> Option<DeliveryStatus> {
        match s {
            "PENDING" => Some(DeliveryStatus::Pending),
            "DELIVERED" => Some(DeliveryStatus::Delivered),
            "ACKED" => Some(DeliveryStatus::Acked),
            "READ" => Some(DeliveryStatus::Read),
            _ => None,
        }
    }
}

/// One encrypted copy in a recipient device's mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxEntry {
    pub recipient_device_id: Uuid,
    pub message_uuid: Uuid,
    pub sealed_payload: String,
    pub nonce: String,
    pub status: DeliveryStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMailboxEntry {
    pub recipient_device_id: Uuid,
    pub message_uuid: Uuid,
    pub sealed_payload: String,
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReceiptType {
    Delivered,
    Read,
}

impl ReceiptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptType::Delivered => "DELIVERED",
            ReceiptType::Read => "READ",
        }
    }

    pub fn parse(s: &str) -> Option<ReceiptType> {
        match s {
            "DELIVERED" => Some(ReceiptType::Delivered),
            "READ" => Some(ReceiptType::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptRecord {
    pub receipt_id: i64,
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    pub receipt_type: ReceiptType,
    pub user_id: Uuid,
    pub sender_device: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    pub receipt_type: ReceiptType,
    pub user_id: Uuid,
    pub sender_device: Uuid,
}

/// Risk classification derived from the capped abuse score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<RiskLevel> {
        match s {
            "LOW" => Some(RiskLevel::Low),
            "MEDIUM" => Some(RiskLevel::Medium),
            "HIGH" => Some(RiskLevel::High),
            "CRITICAL" => Some(RiskLevel::Critical),
            _ => None,
        }
    }
}

/// Per-user abuse state. Score decays toward zero when no new events arrive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbuseScore {
    pub user_id: Uuid,
    pub score: i32,
    pub risk_level: RiskLevel,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl AbuseScore {
    /// Zero-score default for users with no recorded events.
    pub fn clean(user_id: Uuid) -> Self {
        Self {
            user_id,
            score: 0,
            risk_level: RiskLevel::Low,
            cooldown_until: None,
            last_updated: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_state_round_trips() {
        for s in [TrustState::Pending, TrustState::Trusted, TrustState::Revoked] {
            assert_eq!(TrustState::parse(s.as_str()), Some(s));
        }
        assert_eq!(TrustState::parse("ACTIVE"), None);
    }

    #[test]
    fn delivery_status_round_trips() {
        for s in [
            DeliveryStatus::Pending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Acked,
            DeliveryStatus::Read,
        ] {
            assert_eq!(DeliveryStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn risk_levels_are_ordered() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }
}
