// ============================================================================
// Axum Extractors
// ============================================================================
//
// AuthenticatedDevice pulls the caller identity established by the external
// auth layer out of the x-user-id / x-device-uuid headers. The relay trusts
// these headers; terminating auth happens in front of it.
//
// ============================================================================

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::AppContext;

#[derive(Debug, Clone, Copy)]
pub struct AuthenticatedDevice {
    pub user_id: Uuid,
    pub device_id: Uuid,
}

fn header_uuid(parts: &Parts, name: &str) -> Result<Uuid, Response> {
    let raw = parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| unauthorized(&format!("missing {} header", name)))?;
    Uuid::parse_str(raw).map_err(|_| unauthorized(&format!("malformed {} header", name)))
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({
            "error": "UNAUTHENTICATED",
            "message": message,
        })),
    )
        .into_response()
}

#[async_trait]
impl FromRequestParts<Arc<AppContext>> for AuthenticatedDevice {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppContext>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = header_uuid(parts, "x-user-id")?;
        let device_id = header_uuid(parts, "x-device-uuid")?;
        Ok(AuthenticatedDevice { user_id, device_id })
    }
}

/// Client IP for rate-limit fallback: first hop of x-forwarded-for, then
/// x-real-ip.
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
