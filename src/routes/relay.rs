// ============================================================================
// Relay Routes
// ============================================================================
//
// Endpoints:
// - POST /relay/send    - sequence and fan out one encrypted message
// - GET  /relay/pull    - catch up after a client's last-known sequence
// - GET  /relay/repair  - exact slice for a detected sequence gap
// - POST /relay/receipt - delivery/read confirmation (idempotent)
// - GET  /relay/inbox   - drain this device's sealed mailbox copies
//
// Every handler runs the same admission gate first: hard sliding-window
// rate limit, then the soft abuse gate.
//
// ============================================================================

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::admission::{
    identifier_for, AbuseGate, RateDecision, EVENT_RATE_LIMIT_HIT, EVENT_REPAIR_ABUSE,
};
use crate::audit;
use crate::config::{RateLimitRule, ABUSE_WEIGHT_RATE_LIMIT_HIT, ABUSE_WEIGHT_REPAIR_ABUSE};
use crate::context::AppContext;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::routes::extractors::{extract_client_ip, AuthenticatedDevice};
use crate::types::{ReceiptType, TrustState};

/// Rate limiter first, abuse gate second. A rate-limit rejection also feeds
/// the abuse score, so persistent hammering escalates on its own.
async fn admit(
    ctx: &AppContext,
    auth: AuthenticatedDevice,
    headers: &HeaderMap,
    endpoint: &'static str,
    rule: &RateLimitRule,
) -> AppResult<()> {
    let now = Utc::now();
    let ip = extract_client_ip(headers);
    let identifier = identifier_for(Some(auth.device_id), Some(auth.user_id), &ip);

    match ctx
        .rate_limiter
        .check_and_record(&identifier, endpoint, rule, now)
        .await?
    {
        RateDecision::Denied { retry_after_sec } => {
            metrics::RATE_LIMITED_TOTAL.inc();
            audit::rate_limited(&identifier, endpoint, retry_after_sec);
            ctx.abuse
                .record_event(
                    auth.user_id,
                    Some(auth.device_id),
                    EVENT_RATE_LIMIT_HIT,
                    ABUSE_WEIGHT_RATE_LIMIT_HIT,
                    now,
                )
                .await?;
            return Err(AppError::RateLimited { retry_after_sec });
        }
        RateDecision::Allowed => {}
    }

    match ctx.abuse.gate(auth.user_id, now).await? {
        AbuseGate::Blocked {
            risk_level,
            action,
            retry_after_sec,
        } => {
            metrics::ABUSE_BLOCKED_TOTAL.inc();
            audit::abuse_rejected(auth.user_id, risk_level, action);
            Err(AppError::AbuseBlocked {
                risk_level,
                action,
                retry_after_sec,
            })
        }
        AbuseGate::Delayed { delay_ms } => {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            Ok(())
        }
        AbuseGate::Clear => Ok(()),
    }
}

async fn require_trusted(ctx: &AppContext, auth: AuthenticatedDevice) -> AppResult<()> {
    match ctx.store.trust_state(auth.device_id).await? {
        Some(TrustState::Trusted) => Ok(()),
        Some(TrustState::Pending) => Err(AppError::NotAuthorized(
            "device is pending approval".into(),
        )),
        Some(TrustState::Revoked) | None => Err(AppError::DeviceRevoked),
    }
}

#[derive(Deserialize)]
pub struct SendRequest {
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    pub encrypted_payload: String,
}

/// POST /relay/send
pub async fn send(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_trusted(&ctx, auth).await?;
    admit(&ctx, auth, &headers, "send", &ctx.config.admission.send).await?;

    let outcome = ctx
        .engine
        .send(
            auth.user_id,
            auth.device_id,
            req.conversation_id,
            req.message_uuid,
            req.encrypted_payload,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "server_seq": outcome.server_seq,
        "duplicate": outcome.duplicate,
        "timestamp": outcome.timestamp,
    })))
}

#[derive(Deserialize)]
pub struct PullQuery {
    pub conversation_id: Uuid,
    #[serde(default)]
    pub since_seq: i64,
    #[serde(default)]
    pub since_receipt_id: i64,
    pub limit: Option<i64>,
}

/// GET /relay/pull
pub async fn pull(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_trusted(&ctx, auth).await?;
    admit(&ctx, auth, &headers, "pull", &ctx.config.admission.pull).await?;

    let page = ctx
        .engine
        .pull(
            auth.user_id,
            query.conversation_id,
            query.since_seq,
            query.since_receipt_id,
            query.limit,
        )
        .await?;

    Ok(Json(json!({
        "messages": page.messages,
        "receipts": page.receipts,
        "last_seq": page.last_seq,
        "last_receipt_id": page.last_receipt_id,
        "has_more": page.has_more,
    })))
}

#[derive(Deserialize)]
pub struct RepairQuery {
    pub conversation_id: Uuid,
    pub start_seq: i64,
    pub end_seq: i64,
}

/// GET /relay/repair
pub async fn repair(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    headers: HeaderMap,
    Query(query): Query<RepairQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_trusted(&ctx, auth).await?;
    admit(&ctx, auth, &headers, "repair", &ctx.config.admission.repair).await?;

    let result = ctx
        .engine
        .repair_range(
            auth.user_id,
            query.conversation_id,
            query.start_seq,
            query.end_seq,
        )
        .await;

    // An oversized range is an abuse signal, not just a validation error.
    if let Err(AppError::RangeTooLarge { .. }) = &result {
        ctx.abuse
            .record_event(
                auth.user_id,
                Some(auth.device_id),
                EVENT_REPAIR_ABUSE,
                ABUSE_WEIGHT_REPAIR_ABUSE,
                Utc::now(),
            )
            .await?;
    }
    let messages = result?;
    let count = messages.len();

    Ok(Json(json!({
        "messages": messages,
        "count": count,
    })))
}

#[derive(Deserialize)]
pub struct ReceiptRequest {
    pub conversation_id: Uuid,
    pub message_uuid: Uuid,
    #[serde(rename = "type")]
    pub receipt_type: ReceiptType,
}

/// POST /relay/receipt
pub async fn receipt(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    headers: HeaderMap,
    Json(req): Json<ReceiptRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_trusted(&ctx, auth).await?;
    admit(&ctx, auth, &headers, "receipt", &ctx.config.admission.receipt).await?;

    let outcome = ctx
        .engine
        .submit_receipt(
            auth.user_id,
            auth.device_id,
            req.conversation_id,
            req.message_uuid,
            req.receipt_type,
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "newly_created": outcome.newly_created,
        "delivery_state": outcome.delivery_state.as_str(),
    })))
}

#[derive(Deserialize)]
pub struct InboxQuery {
    pub limit: Option<i64>,
}

/// GET /relay/inbox
pub async fn inbox(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    headers: HeaderMap,
    Query(query): Query<InboxQuery>,
) -> Result<impl IntoResponse, AppError> {
    require_trusted(&ctx, auth).await?;
    admit(&ctx, auth, &headers, "pull", &ctx.config.admission.pull).await?;

    let entries = ctx.engine.drain_inbox(auth.device_id, query.limit).await?;
    let count = entries.len();

    Ok(Json(json!({
        "entries": entries,
        "count": count,
    })))
}
