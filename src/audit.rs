//! Structured audit events, emitted under the `audit` target so deployments
//! can route them to a separate sink from application logs.

use uuid::Uuid;

use crate::error::AbuseAction;
use crate::types::RiskLevel;

pub fn message_sequenced(conversation_id: Uuid, message_uuid: Uuid, server_seq: i64) {
    tracing::info!(
        target: "audit",
        event = "message_sequenced",
        %conversation_id,
        %message_uuid,
        server_seq,
    );
}

pub fn duplicate_suppressed(conversation_id: Uuid, message_uuid: Uuid, server_seq: i64) {
    tracing::info!(
        target: "audit",
        event = "duplicate_suppressed",
        %conversation_id,
        %message_uuid,
        server_seq,
    );
}

pub fn membership_denied(user_id: Uuid, conversation_id: Uuid, operation: &str) {
    tracing::warn!(
        target: "audit",
        event = "membership_denied",
        %user_id,
        %conversation_id,
        operation,
    );
}

pub fn rate_limited(identifier: &str, endpoint: &str, retry_after_sec: i64) {
    tracing::warn!(
        target: "audit",
        event = "rate_limited",
        identifier,
        endpoint,
        retry_after_sec,
    );
}

pub fn abuse_rejected(user_id: Uuid, risk_level: RiskLevel, action: AbuseAction) {
    tracing::warn!(
        target: "audit",
        event = "abuse_rejected",
        %user_id,
        risk_level = risk_level.as_str(),
        action = action.as_str(),
    );
}

pub fn device_registered(user_id: Uuid, device_id: Uuid, trusted: bool) {
    tracing::info!(
        target: "audit",
        event = "device_registered",
        %user_id,
        %device_id,
        trusted,
    );
}

pub fn device_approved(user_id: Uuid, device_id: Uuid) {
    tracing::info!(
        target: "audit",
        event = "device_approved",
        %user_id,
        %device_id,
    );
}

pub fn device_revoked(user_id: Uuid, device_id: Uuid) {
    tracing::warn!(
        target: "audit",
        event = "device_revoked",
        %user_id,
        %device_id,
    );
}
