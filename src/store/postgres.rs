// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// Production implementation of the store traits over one shared pool.
//
// Serialization points:
// - conversation_sequences: the sequencing transaction's upsert-increment
//   takes the counter row lock, so senders to the same conversation
//   serialize on that row for the duration of increment + message insert
// - messages (conversation_id, message_uuid): uniqueness constraint
//   arbitrates concurrent retries
// - receipts: uniqueness constraint makes repeat submissions no-ops
//
// Everything else runs fully parallel.
//
// ============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config::{
    ABUSE_COOLDOWN_SECS, ABUSE_DECAY_PER_HOUR, ABUSE_SCORE_CAP, ABUSE_THRESHOLD_CRITICAL,
    ABUSE_THRESHOLD_HIGH, ABUSE_THRESHOLD_MEDIUM, DbConfig,
};
use crate::relay::crypto::session_id;
use crate::store::{
    AdmissionStore, DeviceDirectory, MailboxStore, MessageStore, Sequencer, SequenceOutcome,
    SessionStore,
};
use crate::types::{
    AbuseScore, DeliveryStatus, DeviceRecord, MailboxEntry, MessageRecord, NewDevice,
    NewMailboxEntry, NewMessage, NewReceipt, ReceiptRecord, RiskLevel, TrustState,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_trust(raw: &str) -> Result<TrustState> {
    TrustState::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown trust_state {:?}", raw))
}

fn parse_status(raw: &str) -> Result<DeliveryStatus> {
    DeliveryStatus::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown delivery status {:?}", raw))
}

fn parse_risk(raw: &str) -> Result<RiskLevel> {
    RiskLevel::parse(raw).ok_or_else(|| anyhow::anyhow!("unknown risk_level {:?}", raw))
}

fn parse_receipt_type(raw: &str) -> Result<crate::types::ReceiptType> {
    crate::types::ReceiptType::parse(raw)
        .ok_or_else(|| anyhow::anyhow!("unknown receipt_type {:?}", raw))
}

type MessageRow = (Uuid, Uuid, Uuid, Uuid, i64, String, DateTime<Utc>);

fn message_from_row(row: MessageRow) -> MessageRecord {
    let (conversation_id, message_uuid, sender_id, sender_device, server_seq, payload, created_at) =
        row;
    MessageRecord {
        conversation_id,
        message_uuid,
        sender_id,
        sender_device,
        server_seq,
        encrypted_payload: payload,
        created_at,
    }
}

const MESSAGE_COLUMNS: &str =
    "conversation_id, message_uuid, sender_id, sender_device, server_seq, encrypted_payload, created_at";

#[async_trait::async_trait]
impl Sequencer for PostgresStore {
    async fn sequence_message(&self, message: &NewMessage) -> Result<SequenceOutcome> {
        // Increment and insert commit together. The upsert-increment locks
        // the counter row for the rest of the transaction, so senders to the
        // same conversation serialize here and the insert below can only
        // conflict with an already committed duplicate.
        let mut tx = self.pool.begin().await.context("Failed to begin send")?;

        let server_seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO conversation_sequences (conversation_id, last_seq)
            VALUES ($1, 1)
            ON CONFLICT (conversation_id)
                DO UPDATE SET last_seq = conversation_sequences.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(message.conversation_id)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to assign sequence")?;

        let inserted: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            INSERT INTO messages
                (conversation_id, message_uuid, sender_id, sender_device,
                 encrypted_payload, server_seq)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (conversation_id, message_uuid) DO NOTHING
            RETURNING created_at
            "#,
        )
        .bind(message.conversation_id)
        .bind(message.message_uuid)
        .bind(message.sender_id)
        .bind(message.sender_device)
        .bind(&message.encrypted_payload)
        .bind(server_seq)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to store message")?;

        if let Some((timestamp,)) = inserted {
            tx.commit().await.context("Failed to commit send")?;
            return Ok(SequenceOutcome::Sequenced {
                server_seq,
                timestamp,
            });
        }

        // Duplicate: undo the increment and echo the original row back.
        tx.rollback().await.context("Failed to roll back send")?;
        let (server_seq, timestamp): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"
            SELECT server_seq, created_at FROM messages
            WHERE conversation_id = $1 AND message_uuid = $2
            "#,
        )
        .bind(message.conversation_id)
        .bind(message.message_uuid)
        .fetch_one(&self.pool)
        .await
        .context("Failed to load duplicate message")?;

        Ok(SequenceOutcome::Duplicate {
            server_seq,
            timestamp,
        })
    }
}

#[async_trait::async_trait]
impl MessageStore for PostgresStore {
    async fn messages_after(
        &self,
        conversation_id: Uuid,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1 AND server_seq > $2
            ORDER BY server_seq ASC
            LIMIT $3
            "#
        ))
        .bind(conversation_id)
        .bind(since_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to pull messages")?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn messages_in_range(
        &self,
        conversation_id: Uuid,
        start_seq: i64,
        end_seq: i64,
    ) -> Result<Vec<MessageRecord>> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM messages
            WHERE conversation_id = $1 AND server_seq BETWEEN $2 AND $3
            ORDER BY server_seq ASC
            "#
        ))
        .bind(conversation_id)
        .bind(start_seq)
        .bind(end_seq)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read repair range")?;
        Ok(rows.into_iter().map(message_from_row).collect())
    }

    async fn is_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<bool> {
        let exists: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM conversation_members WHERE conversation_id = $1 AND user_id = $2",
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed membership check")?;
        Ok(exists.is_some())
    }

    async fn members(&self, conversation_id: Uuid) -> Result<Vec<Uuid>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(
            "SELECT user_id FROM conversation_members WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list members")?;
        Ok(rows)
    }

    async fn add_member(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_members (conversation_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT (conversation_id, user_id) DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to add member")?;
        Ok(())
    }

    async fn insert_receipt(&self, receipt: &NewReceipt) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO receipts
                (conversation_id, message_uuid, receipt_type, user_id, sender_device)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (conversation_id, message_uuid, receipt_type, sender_device)
                DO NOTHING
            "#,
        )
        .bind(receipt.conversation_id)
        .bind(receipt.message_uuid)
        .bind(receipt.receipt_type.as_str())
        .bind(receipt.user_id)
        .bind(receipt.sender_device)
        .execute(&self.pool)
        .await
        .context("Failed to insert receipt")?;
        Ok(result.rows_affected() > 0)
    }

    async fn receipts_after(
        &self,
        conversation_id: Uuid,
        since_receipt_id: i64,
        limit: i64,
    ) -> Result<Vec<ReceiptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT receipt_id, conversation_id, message_uuid, receipt_type,
                   user_id, sender_device, created_at
            FROM receipts
            WHERE conversation_id = $1 AND receipt_id > $2
            ORDER BY receipt_id ASC
            LIMIT $3
            "#,
        )
        .bind(conversation_id)
        .bind(since_receipt_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to pull receipts")?;

        rows.into_iter()
            .map(|row| {
                let receipt_type: String = row.try_get("receipt_type")?;
                Ok(ReceiptRecord {
                    receipt_id: row.try_get("receipt_id")?,
                    conversation_id: row.try_get("conversation_id")?,
                    message_uuid: row.try_get("message_uuid")?,
                    receipt_type: parse_receipt_type(&receipt_type)?,
                    user_id: row.try_get("user_id")?,
                    sender_device: row.try_get("sender_device")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DeviceDirectory for PostgresStore {
    async fn insert_device(&self, device: &NewDevice, initial_state: TrustState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO devices
                (device_id, user_id, platform, public_identity_key, public_pre_key, trust_state)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(&device.platform)
        .bind(&device.public_identity_key)
        .bind(&device.public_pre_key)
        .bind(initial_state.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to insert device")?;
        Ok(())
    }

    async fn device(&self, device_id: Uuid) -> Result<Option<DeviceRecord>> {
        let row = sqlx::query(
            r#"
            SELECT device_id, user_id, platform, public_identity_key, public_pre_key,
                   trust_state, created_at, last_seen_at, revoked_at
            FROM devices WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load device")?;

        row.map(|row| {
            let trust_state: String = row.try_get("trust_state")?;
            Ok(DeviceRecord {
                device_id: row.try_get("device_id")?,
                user_id: row.try_get("user_id")?,
                platform: row.try_get("platform")?,
                public_identity_key: row.try_get("public_identity_key")?,
                public_pre_key: row.try_get("public_pre_key")?,
                trust_state: parse_trust(&trust_state)?,
                created_at: row.try_get("created_at")?,
                last_seen_at: row.try_get("last_seen_at")?,
                revoked_at: row.try_get("revoked_at")?,
            })
        })
        .transpose()
    }

    async fn trust_state(&self, device_id: Uuid) -> Result<Option<TrustState>> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT trust_state FROM devices WHERE device_id = $1")
                .bind(device_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load trust state")?;
        raw.map(|raw| parse_trust(&raw)).transpose()
    }

    async fn trusted_devices(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT device_id FROM devices
            WHERE user_id = $1 AND trust_state = 'TRUSTED' AND revoked_at IS NULL
            ORDER BY device_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list trusted devices")?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(device) = self.device(id).await? {
                out.push(device);
            }
        }
        Ok(out)
    }

    async fn trusted_device_count(&self, user_id: Uuid) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM devices
            WHERE user_id = $1 AND trust_state = 'TRUSTED' AND revoked_at IS NULL
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count trusted devices")?;
        Ok(count)
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<DeviceRecord>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT device_id FROM devices WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list devices")?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(device) = self.device(id).await? {
                out.push(device);
            }
        }
        Ok(out)
    }

    async fn approve_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET trust_state = 'TRUSTED'
            WHERE device_id = $1 AND user_id = $2 AND trust_state = 'PENDING'
            "#,
        )
        .bind(device_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to approve device")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_device(&self, user_id: Uuid, device_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET trust_state = 'REVOKED', revoked_at = NOW()
            WHERE device_id = $1 AND user_id = $2
            "#,
        )
        .bind(device_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to revoke device")?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_pre_key(&self, device_id: Uuid, pre_key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET public_pre_key = $2, last_seen_at = NOW() WHERE device_id = $1",
        )
        .bind(device_id)
        .bind(pre_key)
        .execute(&self.pool)
        .await
        .context("Failed to rotate pre-key")?;
        Ok(())
    }

    async fn touch_last_seen(&self, device_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen_at = NOW() WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .context("Failed to touch last_seen")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MailboxStore for PostgresStore {
    async fn insert_entry(&self, entry: &NewMailboxEntry) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO device_mailbox
                (recipient_device_id, message_uuid, sealed_payload, nonce, status, expires_at)
            VALUES ($1, $2, $3, $4, 'PENDING', $5)
            ON CONFLICT (recipient_device_id, message_uuid) DO NOTHING
            "#,
        )
        .bind(entry.recipient_device_id)
        .bind(entry.message_uuid)
        .bind(&entry.sealed_payload)
        .bind(&entry.nonce)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert mailbox entry")?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_status(
        &self,
        recipient_device_id: Uuid,
        message_uuid: Uuid,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE device_mailbox SET status = $3
            WHERE recipient_device_id = $1 AND message_uuid = $2
            "#,
        )
        .bind(recipient_device_id)
        .bind(message_uuid)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to update mailbox status")?;
        Ok(result.rows_affected() > 0)
    }

    async fn statuses_for_message(
        &self,
        message_uuid: Uuid,
    ) -> Result<Vec<(Uuid, DeliveryStatus, TrustState)>> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT di.recipient_device_id, di.status, d.trust_state
            FROM device_mailbox di
            JOIN devices d ON di.recipient_device_id = d.device_id
            WHERE di.message_uuid = $1
            "#,
        )
        .bind(message_uuid)
        .fetch_all(&self.pool)
        .await
        .context("Failed to aggregate delivery status")?;

        rows.into_iter()
            .map(|(device, status, trust)| {
                Ok((device, parse_status(&status)?, parse_trust(&trust)?))
            })
            .collect()
    }

    async fn pending_for_device(&self, device_id: Uuid, limit: i64) -> Result<Vec<MailboxEntry>> {
        let rows: Vec<(Uuid, Uuid, String, String, String, DateTime<Utc>, DateTime<Utc>)> =
            sqlx::query_as(
                r#"
                SELECT recipient_device_id, message_uuid, sealed_payload, nonce,
                       status, expires_at, created_at
                FROM device_mailbox
                WHERE recipient_device_id = $1 AND status = 'PENDING'
                ORDER BY created_at ASC
                LIMIT $2
                "#,
            )
            .bind(device_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to drain mailbox")?;

        rows.into_iter()
            .map(
                |(recipient_device_id, message_uuid, sealed_payload, nonce, status, expires_at, created_at)| {
                    Ok(MailboxEntry {
                        recipient_device_id,
                        message_uuid,
                        sealed_payload,
                        nonce,
                        status: parse_status(&status)?,
                        expires_at,
                        created_at,
                    })
                },
            )
            .collect()
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM device_mailbox WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to purge mailbox")?;
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl SessionStore for PostgresStore {
    async fn load_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
    ) -> Result<Option<Vec<u8>>> {
        let key: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT session_key FROM device_sessions WHERE session_id = $1")
                .bind(session_id(sender_device, recipient_device))
                .fetch_optional(&self.pool)
                .await
                .context("Failed to load session key")?;
        Ok(key)
    }

    async fn save_session_key(
        &self,
        sender_device: Uuid,
        recipient_device: Uuid,
        key: &[u8],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_sessions (session_id, sender_device, recipient_device, session_key)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE SET
                session_key = EXCLUDED.session_key,
                last_active_at = NOW()
            "#,
        )
        .bind(session_id(sender_device, recipient_device))
        .bind(sender_device)
        .bind(recipient_device)
        .bind(key)
        .execute(&self.pool)
        .await
        .context("Failed to save session key")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AdmissionStore for PostgresStore {
    async fn record_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_events (identifier, endpoint, occurred_at) VALUES ($1, $2, $3)",
        )
        .bind(identifier)
        .bind(endpoint)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to record rate event")?;
        Ok(())
    }

    async fn count_rate_events(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM rate_limit_events
            WHERE identifier = $1 AND endpoint = $2 AND occurred_at >= $3
            "#,
        )
        .bind(identifier)
        .bind(endpoint)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count rate events")?;
        Ok(count)
    }

    async fn oldest_rate_event(
        &self,
        identifier: &str,
        endpoint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(occurred_at) FROM rate_limit_events
            WHERE identifier = $1 AND endpoint = $2 AND occurred_at >= $3
            "#,
        )
        .bind(identifier)
        .bind(endpoint)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .context("Failed to find oldest rate event")?;
        Ok(oldest)
    }

    async fn sweep_rate_events(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_events WHERE occurred_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to sweep rate events")?;
        Ok(result.rows_affected())
    }

    async fn apply_abuse_event(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        event_type: &str,
        weight: i32,
        now: DateTime<Utc>,
    ) -> Result<AbuseScore> {
        sqlx::query(
            r#"
            INSERT INTO abuse_events (user_id, device_id, event_type, weight, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(event_type)
        .bind(weight)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to append abuse event")?;

        // Score math lives in the statement so concurrent events stay atomic:
        // cap, thresholds and the cooldown trigger all apply to the same
        // post-increment value.
        let row: (i32, String, Option<DateTime<Utc>>, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO abuse_scores (user_id, score, risk_level, cooldown_until, last_updated)
            VALUES (
                $1,
                LEAST(GREATEST($2, 0), $3),
                CASE
                    WHEN LEAST(GREATEST($2, 0), $3) >= $6 THEN 'CRITICAL'
                    WHEN LEAST(GREATEST($2, 0), $3) >= $5 THEN 'HIGH'
                    WHEN LEAST(GREATEST($2, 0), $3) >= $4 THEN 'MEDIUM'
                    ELSE 'LOW'
                END,
                CASE
                    WHEN LEAST(GREATEST($2, 0), $3) >= $6
                        THEN $7::timestamptz + make_interval(secs => $8)
                    ELSE NULL
                END,
                $7
            )
            ON CONFLICT (user_id) DO UPDATE SET
                score = LEAST(GREATEST(abuse_scores.score + $2, 0), $3),
                risk_level = CASE
                    WHEN LEAST(GREATEST(abuse_scores.score + $2, 0), $3) >= $6 THEN 'CRITICAL'
                    WHEN LEAST(GREATEST(abuse_scores.score + $2, 0), $3) >= $5 THEN 'HIGH'
                    WHEN LEAST(GREATEST(abuse_scores.score + $2, 0), $3) >= $4 THEN 'MEDIUM'
                    ELSE 'LOW'
                END,
                cooldown_until = CASE
                    WHEN LEAST(GREATEST(abuse_scores.score + $2, 0), $3) >= $6
                        THEN $7::timestamptz + make_interval(secs => $8)
                    ELSE abuse_scores.cooldown_until
                END,
                last_updated = $7
            RETURNING score, risk_level, cooldown_until, last_updated
            "#,
        )
        .bind(user_id)
        .bind(weight)
        .bind(ABUSE_SCORE_CAP)
        .bind(ABUSE_THRESHOLD_MEDIUM)
        .bind(ABUSE_THRESHOLD_HIGH)
        .bind(ABUSE_THRESHOLD_CRITICAL)
        .bind(now)
        .bind(ABUSE_COOLDOWN_SECS as f64)
        .fetch_one(&self.pool)
        .await
        .context("Failed to update abuse score")?;

        let (score, risk_level, cooldown_until, last_updated) = row;
        Ok(AbuseScore {
            user_id,
            score,
            risk_level: parse_risk(&risk_level)?,
            cooldown_until,
            last_updated,
        })
    }

    async fn abuse_score(&self, user_id: Uuid) -> Result<Option<AbuseScore>> {
        let row: Option<(i32, String, Option<DateTime<Utc>>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT score, risk_level, cooldown_until, last_updated
            FROM abuse_scores WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load abuse score")?;

        row.map(|(score, risk_level, cooldown_until, last_updated)| {
            Ok(AbuseScore {
                user_id,
                score,
                risk_level: parse_risk(&risk_level)?,
                cooldown_until,
                last_updated,
            })
        })
        .transpose()
    }

    async fn decay_abuse_scores(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - Duration::hours(1);
        let result = sqlx::query(
            r#"
            UPDATE abuse_scores
            SET score = GREATEST(score - $1, 0),
                risk_level = CASE
                    WHEN GREATEST(score - $1, 0) >= $4 THEN 'CRITICAL'
                    WHEN GREATEST(score - $1, 0) >= $3 THEN 'HIGH'
                    WHEN GREATEST(score - $1, 0) >= $2 THEN 'MEDIUM'
                    ELSE 'LOW'
                END
            WHERE last_updated <= $5 AND score > 0
            "#,
        )
        .bind(ABUSE_DECAY_PER_HOUR)
        .bind(ABUSE_THRESHOLD_MEDIUM)
        .bind(ABUSE_THRESHOLD_HIGH)
        .bind(ABUSE_THRESHOLD_CRITICAL)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to decay abuse scores")?;
        Ok(result.rows_affected())
    }
}
