// ============================================================================
// Device Routes
// ============================================================================
//
// Endpoints:
// - POST /devices/register           - register this device (or rotate keys)
// - GET  /devices                    - list the caller's devices
// - POST /devices/:device_id/approve - approve a pending device
// - POST /devices/:device_id/revoke  - revoke a device
// - POST /devices/session            - store a pairwise session key
//
// ============================================================================

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::extractors::AuthenticatedDevice;
use crate::types::NewDevice;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub platform: String,
    pub public_identity_key: String,
    pub public_pre_key: String,
}

/// POST /devices/register
pub async fn register(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.public_identity_key.is_empty() || req.public_pre_key.is_empty() {
        return Err(AppError::Validation("device keys must not be empty".into()));
    }

    let (device, trusted) = ctx
        .devices
        .register(NewDevice {
            device_id: auth.device_id,
            user_id: auth.user_id,
            platform: req.platform,
            public_identity_key: req.public_identity_key,
            public_pre_key: req.public_pre_key,
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "device_id": device.device_id,
        "trust_state": device.trust_state.as_str(),
        "trusted": trusted,
    })))
}

/// GET /devices
pub async fn list(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
) -> Result<impl IntoResponse, AppError> {
    let devices = ctx.devices.list(auth.user_id).await?;
    Ok(Json(json!({ "devices": devices })))
}

/// POST /devices/:device_id/approve
pub async fn approve(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    ctx.devices
        .approve(auth.user_id, auth.device_id, device_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /devices/:device_id/revoke
pub async fn revoke(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    Path(device_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    ctx.devices
        .revoke(auth.user_id, auth.device_id, device_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct SessionRequest {
    pub recipient_device: Uuid,
    pub session_key: String,
}

/// POST /devices/session
pub async fn establish_session(
    State(ctx): State<Arc<AppContext>>,
    auth: AuthenticatedDevice,
    Json(req): Json<SessionRequest>,
) -> Result<impl IntoResponse, AppError> {
    ctx.devices
        .establish_session(
            auth.user_id,
            auth.device_id,
            req.recipient_device,
            &req.session_key,
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}
