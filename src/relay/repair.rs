// ============================================================================
// Pull & Repair
// ============================================================================
//
// Pull is the steady-state catch-up path: everything after a client's
// last-known server_seq, paginated. Repair serves an exact inclusive slice
// when a client detects a gap in its sequence numbers. Both require
// conversation membership and reject before touching message bodies.
// ============================================================================

use chrono::Utc;
use uuid::Uuid;

use crate::audit;
use crate::config::{DEFAULT_PULL_LIMIT, MAX_PULL_LIMIT, REPAIR_MAX_RANGE};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::relay::send::RelayEngine;
use crate::types::{DeliveryStatus, MailboxEntry, MessageRecord, ReceiptRecord};

pub struct PullPage {
    pub messages: Vec<MessageRecord>,
    pub receipts: Vec<ReceiptRecord>,
    pub last_seq: i64,
    pub last_receipt_id: i64,
    pub has_more: bool,
}

impl RelayEngine {
    /// Everything sequenced after `since_seq`, plus receipts after
    /// `since_receipt_id`, up to `limit` of each.
    pub async fn pull(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        since_seq: i64,
        since_receipt_id: i64,
        limit: Option<i64>,
    ) -> AppResult<PullPage> {
        if !self.store.is_member(conversation_id, user_id).await? {
            audit::membership_denied(user_id, conversation_id, "pull");
            return Err(AppError::NotAuthorized(
                "not a member of this conversation".into(),
            ));
        }

        let limit = limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT);

        // Fetch one past the limit to learn whether a further page exists.
        let mut messages = self
            .store
            .messages_after(conversation_id, since_seq, limit + 1)
            .await?;
        let has_more = messages.len() as i64 > limit;
        messages.truncate(limit as usize);

        let receipts = self
            .store
            .receipts_after(conversation_id, since_receipt_id, limit)
            .await?;

        let last_seq = messages
            .iter()
            .map(|m| m.server_seq)
            .max()
            .unwrap_or(since_seq);
        let last_receipt_id = receipts
            .iter()
            .map(|r| r.receipt_id)
            .max()
            .unwrap_or(since_receipt_id);

        Ok(PullPage {
            messages,
            receipts,
            last_seq,
            last_receipt_id,
            has_more,
        })
    }

    /// Exact inclusive slice [start_seq, end_seq] for gap repair. The range
    /// width is validated before any message row is read.
    pub async fn repair_range(
        &self,
        user_id: Uuid,
        conversation_id: Uuid,
        start_seq: i64,
        end_seq: i64,
    ) -> AppResult<Vec<MessageRecord>> {
        if start_seq < 1 || end_seq < start_seq {
            return Err(AppError::Validation(format!(
                "invalid repair range {}..{}",
                start_seq, end_seq
            )));
        }
        let requested = end_seq - start_seq + 1;
        if requested > REPAIR_MAX_RANGE {
            return Err(AppError::RangeTooLarge {
                requested,
                max: REPAIR_MAX_RANGE,
            });
        }

        if !self.store.is_member(conversation_id, user_id).await? {
            audit::membership_denied(user_id, conversation_id, "repair");
            return Err(AppError::NotAuthorized(
                "not a member of this conversation".into(),
            ));
        }

        metrics::REPAIR_REQUESTS_TOTAL.inc();
        let messages = self
            .store
            .messages_in_range(conversation_id, start_seq, end_seq)
            .await?;
        tracing::debug!(
            %conversation_id,
            start_seq,
            end_seq,
            returned = messages.len(),
            "Served repair range"
        );
        Ok(messages)
    }

    /// Drain a device's pending mailbox copies, marking each returned entry
    /// DELIVERED. Expired entries are never handed out.
    pub async fn drain_inbox(
        &self,
        device_id: Uuid,
        limit: Option<i64>,
    ) -> AppResult<Vec<MailboxEntry>> {
        let limit = limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(1, MAX_PULL_LIMIT);
        let now = Utc::now();

        let entries = self.store.pending_for_device(device_id, limit).await?;
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.expires_at <= now {
                continue;
            }
            self.store
                .update_status(device_id, entry.message_uuid, DeliveryStatus::Delivered)
                .await?;
            out.push(entry);
        }
        Ok(out)
    }
}
