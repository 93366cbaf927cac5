// ============================================================================
// Send Pipeline
// ============================================================================
//
// sequence-and-store -> fanout
//
// Sequencing and storage are one atomic store operation arbitrated by the
// (conversation_id, message_uuid) uniqueness constraint: exactly one of any
// number of concurrent retries stores the message, and the losers read back
// the winner's server_seq and report duplicate=true with the same number.
// A failed attempt leaves no partial state behind, so retrying it is safe.
// ============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::audit;
use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::push::WakeGateway;
use crate::relay::fanout::FanoutDispatcher;
use crate::store::{RelayStore, SequenceOutcome};
use crate::types::NewMessage;

#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    pub server_seq: i64,
    pub duplicate: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct RelayEngine {
    pub(crate) store: Arc<dyn RelayStore>,
    pub(crate) fanout: FanoutDispatcher,
}

impl RelayEngine {
    pub fn new(store: Arc<dyn RelayStore>, wake: Arc<dyn WakeGateway>) -> Self {
        let fanout = FanoutDispatcher::new(store.clone(), wake);
        Self { store, fanout }
    }

    pub fn dispatcher(&self) -> &FanoutDispatcher {
        &self.fanout
    }

    /// Accept one message: suppress duplicates, assign the next server_seq,
    /// then fan out copies to every member's trusted devices.
    pub async fn send(
        &self,
        sender_id: Uuid,
        sender_device: Uuid,
        conversation_id: Uuid,
        message_uuid: Uuid,
        encrypted_payload: String,
    ) -> AppResult<SendOutcome> {
        let timer = metrics::SEND_LATENCY.start_timer();

        if encrypted_payload.is_empty() {
            return Err(AppError::Validation("encrypted_payload is empty".into()));
        }
        if encrypted_payload.len() > MAX_PAYLOAD_SIZE {
            return Err(AppError::Validation(format!(
                "encrypted_payload exceeds {} bytes",
                MAX_PAYLOAD_SIZE
            )));
        }

        let outcome = self
            .store
            .sequence_message(&NewMessage {
                conversation_id,
                message_uuid,
                sender_id,
                sender_device,
                encrypted_payload: encrypted_payload.clone(),
            })
            .await?;

        let (server_seq, now) = match outcome {
            SequenceOutcome::Duplicate {
                server_seq,
                timestamp,
            } => {
                metrics::MESSAGES_DUPLICATE_TOTAL.inc();
                audit::duplicate_suppressed(conversation_id, message_uuid, server_seq);
                timer.observe_duration();
                return Ok(SendOutcome {
                    server_seq,
                    duplicate: true,
                    timestamp,
                });
            }
            SequenceOutcome::Sequenced {
                server_seq,
                timestamp,
            } => {
                metrics::MESSAGES_SEQUENCED_TOTAL.inc();
                audit::message_sequenced(conversation_id, message_uuid, server_seq);
                (server_seq, timestamp)
            }
        };

        let members = self.store.members(conversation_id).await?;
        let mut delivered = 0u32;
        for member in members {
            delivered += self
                .fanout
                .fanout(sender_device, member, message_uuid, &encrypted_payload, now)
                .await?;
        }
        tracing::debug!(
            %conversation_id,
            %message_uuid,
            server_seq,
            delivered,
            "Message sequenced and fanned out"
        );

        timer.observe_duration();
        Ok(SendOutcome {
            server_seq,
            duplicate: false,
            timestamp: now,
        })
    }
}
