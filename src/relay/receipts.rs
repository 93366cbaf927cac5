// ============================================================================
// Receipts
// ============================================================================
//
// Delivery/read confirmations from client devices. Idempotent by the
// (conversation, message, type, device) uniqueness constraint: submitting
// the same receipt twice succeeds without creating a second row. A receipt
// also advances the submitting device's own mailbox entry.
// ============================================================================

use uuid::Uuid;

use crate::audit;
use crate::error::{AppError, AppResult};
use crate::relay::fanout::UserDeliveryState;
use crate::relay::send::RelayEngine;
use crate::types::{DeliveryStatus, NewReceipt, ReceiptType};

pub struct ReceiptOutcome {
    /// False when the identical receipt had already been recorded.
    pub newly_created: bool,
    /// User-level indicator for the message after this receipt.
    pub delivery_state: UserDeliveryState,
}

impl RelayEngine {
    pub async fn submit_receipt(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        conversation_id: Uuid,
        message_uuid: Uuid,
        receipt_type: ReceiptType,
    ) -> AppResult<ReceiptOutcome> {
        if !self.store.is_member(conversation_id, user_id).await? {
            audit::membership_denied(user_id, conversation_id, "receipt");
            return Err(AppError::NotAuthorized(
                "not a member of this conversation".into(),
            ));
        }

        let newly_created = self
            .store
            .insert_receipt(&NewReceipt {
                conversation_id,
                message_uuid,
                receipt_type,
                user_id,
                sender_device: device_id,
            })
            .await?;

        // A client receipt also moves that device's mailbox copy forward:
        // DELIVERED from the client means it confirmed receipt (ACKED),
        // READ means the user saw it.
        let status = match receipt_type {
            ReceiptType::Delivered => DeliveryStatus::Acked,
            ReceiptType::Read => DeliveryStatus::Read,
        };
        self.store
            .update_status(device_id, message_uuid, status)
            .await?;

        let delivery_state = self.fanout.delivery_state(message_uuid).await?;
        Ok(ReceiptOutcome {
            newly_created,
            delivery_state,
        })
    }
}
