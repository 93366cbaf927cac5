// ============================================================================
// Fanout Dispatcher
// ============================================================================
//
// Expands one accepted message into per-device mailbox copies:
// 1. snapshot the recipient's currently TRUSTED devices
// 2. load the per-(sender device, recipient device) session key
// 3. seal a device-specific copy
// 4. re-check trust immediately before the write; a device revoked while
//    the loop is running must not receive a copy
// 5. insert the mailbox entry with an expiry
//
// A device without an established session is skipped, never sent to in the
// clear; the skip is counted and logged so operators can see the gap.
// ============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::MAILBOX_TTL_SECS;
use crate::metrics;
use crate::push::{wake_detached, WakeGateway};
use crate::relay::crypto::PayloadSealer;
use crate::store::RelayStore;
use crate::types::{DeliveryStatus, NewMailboxEntry, TrustState};

/// User-level delivery indicator aggregated over all device mailbox rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserDeliveryState {
    Sent,
    Delivered,
    Read,
}

impl UserDeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserDeliveryState::Sent => "SENT",
            UserDeliveryState::Delivered => "DELIVERED",
            UserDeliveryState::Read => "READ",
        }
    }
}

/// READ beats DELIVERED beats SENT; a single device having read the message
/// is enough to mark it read for the user. Only currently TRUSTED devices
/// count: a revoked device's mailbox rows must not move the indicator.
pub fn aggregate_delivery(statuses: &[(Uuid, DeliveryStatus, TrustState)]) -> UserDeliveryState {
    let mut delivered = false;
    for (_, status, trust) in statuses {
        if *trust != TrustState::Trusted {
            continue;
        }
        match status {
            DeliveryStatus::Read => return UserDeliveryState::Read,
            DeliveryStatus::Acked | DeliveryStatus::Delivered => delivered = true,
            DeliveryStatus::Pending => {}
        }
    }
    if delivered {
        UserDeliveryState::Delivered
    } else {
        UserDeliveryState::Sent
    }
}

pub struct FanoutDispatcher {
    store: Arc<dyn RelayStore>,
    wake: Arc<dyn WakeGateway>,
    mailbox_ttl: Duration,
}

impl FanoutDispatcher {
    pub fn new(store: Arc<dyn RelayStore>, wake: Arc<dyn WakeGateway>) -> Self {
        Self {
            store,
            wake,
            mailbox_ttl: Duration::seconds(MAILBOX_TTL_SECS),
        }
    }

    /// Deliver `payload` to every trusted device of `recipient_user`,
    /// excluding the device that sent it. Returns the number of mailbox
    /// entries written. Zero trusted devices is not an error.
    pub async fn fanout(
        &self,
        sender_device: Uuid,
        recipient_user: Uuid,
        message_uuid: Uuid,
        payload: &str,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let devices = self.store.trusted_devices(recipient_user).await?;
        let expires_at = now + self.mailbox_ttl;
        let mut delivered = 0u32;

        for device in devices {
            if device.device_id == sender_device {
                continue;
            }

            let key = match self
                .store
                .load_session_key(sender_device, device.device_id)
                .await?
            {
                Some(key) => key,
                None => {
                    metrics::FANOUT_SKIPPED_NO_SESSION_TOTAL.inc();
                    tracing::warn!(
                        %message_uuid,
                        recipient_device = %device.device_id,
                        "No session established for device pair, skipping copy"
                    );
                    continue;
                }
            };

            let sealed = PayloadSealer::new(&key)?.seal(payload)?;

            // Trust re-check right before the write closes the revoke race.
            if self.store.trust_state(device.device_id).await? != Some(TrustState::Trusted) {
                metrics::FANOUT_SKIPPED_REVOKED_TOTAL.inc();
                tracing::warn!(
                    %message_uuid,
                    recipient_device = %device.device_id,
                    "Device lost trust during fanout, dropping copy"
                );
                continue;
            }

            let inserted = self
                .store
                .insert_entry(&NewMailboxEntry {
                    recipient_device_id: device.device_id,
                    message_uuid,
                    sealed_payload: sealed.ciphertext,
                    nonce: sealed.nonce,
                    expires_at,
                })
                .await?;

            if inserted {
                delivered += 1;
                metrics::FANOUT_ENTRIES_TOTAL.inc();
                wake_detached(self.wake.clone(), device.device_id);
            }
        }

        Ok(delivered)
    }

    /// Aggregate the user-level delivery indicator for one message.
    pub async fn delivery_state(&self, message_uuid: Uuid) -> Result<UserDeliveryState> {
        let statuses = self.store.statuses_for_message(message_uuid).await?;
        Ok(aggregate_delivery(&statuses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DeliveryStatus) -> (Uuid, DeliveryStatus, TrustState) {
        (Uuid::new_v4(), status, TrustState::Trusted)
    }

    #[test]
    fn test_aggregate_empty_is_sent() {
        assert_eq!(aggregate_delivery(&[]), UserDeliveryState::Sent);
    }

    #[test]
    fn test_aggregate_any_read_wins() {
        let statuses = vec![
            entry(DeliveryStatus::Pending),
            entry(DeliveryStatus::Read),
            entry(DeliveryStatus::Delivered),
        ];
        assert_eq!(aggregate_delivery(&statuses), UserDeliveryState::Read);
    }

    #[test]
    fn test_aggregate_acked_counts_as_delivered() {
        let statuses = vec![entry(DeliveryStatus::Pending), entry(DeliveryStatus::Acked)];
        assert_eq!(aggregate_delivery(&statuses), UserDeliveryState::Delivered);
    }

    #[test]
    fn test_aggregate_all_pending_is_sent() {
        let statuses = vec![entry(DeliveryStatus::Pending), entry(DeliveryStatus::Pending)];
        assert_eq!(aggregate_delivery(&statuses), UserDeliveryState::Sent);
    }

    #[test]
    fn test_aggregate_ignores_revoked_devices() {
        // A revoked device claiming READ must not flip the indicator.
        let statuses = vec![
            entry(DeliveryStatus::Pending),
            (Uuid::new_v4(), DeliveryStatus::Read, TrustState::Revoked),
        ];
        assert_eq!(aggregate_delivery(&statuses), UserDeliveryState::Sent);
    }

    #[test]
    fn test_aggregate_only_untrusted_devices_is_sent() {
        let statuses = vec![
            (Uuid::new_v4(), DeliveryStatus::Read, TrustState::Revoked),
            (Uuid::new_v4(), DeliveryStatus::Acked, TrustState::Pending),
        ];
        assert_eq!(aggregate_delivery(&statuses), UserDeliveryState::Sent);
    }
}
