use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::types::RiskLevel;

pub type AppResult<T> = Result<T, AppError>;

/// Action taken by the abuse engine when it refuses a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseAction {
    /// Cooldown window active, everything rejected regardless of score.
    Locked,
    /// CRITICAL risk outside a cooldown window.
    Blocked,
    /// HIGH risk.
    Rejected,
}

impl AbuseAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseAction::Locked => "LOCKED",
            AbuseAction::Blocked => "BLOCKED",
            AbuseAction::Rejected => "REJECTED",
        }
    }
}

/// Application error type covering the relay engine's error taxonomy.
///
/// Admission errors are always recoverable after the stated delay; validation
/// and authorization errors are rejected before any mutation; persistence
/// failures surface as transient and the caller's retry is safe by
/// idempotency.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Admission Errors =====
    #[error("rate limit exceeded, retry after {retry_after_sec}s")]
    RateLimited { retry_after_sec: i64 },

    #[error("request refused by abuse engine ({})", action.as_str())]
    AbuseBlocked {
        risk_level: RiskLevel,
        action: AbuseAction,
        retry_after_sec: Option<i64>,
    },

    // ===== Validation Errors =====
    #[error("validation error: {0}")]
    Validation(String),

    #[error("repair range too large: {requested} exceeds maximum {max}")]
    RangeTooLarge { requested: i64, max: i64 },

    // ===== Authorization Errors =====
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("device revoked or not found")]
    DeviceRevoked,

    // ===== Conflict =====
    #[error("transient conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    // ===== Persistence & Plumbing =====
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID parse error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    /// HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::AbuseBlocked { .. } => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::RangeTooLarge { .. } | AppError::Uuid(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotAuthorized(_) | AppError::DeviceRevoked => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Database(_)
            | AppError::Json(_)
            | AppError::Internal(_)
            | AppError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error code for programmatic handling.
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::AbuseBlocked { .. } => "ABUSE_BLOCKED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::RangeTooLarge { .. } => "RANGE_TOO_LARGE",
            AppError::NotAuthorized(_) => "NOT_AUTHORIZED",
            AppError::DeviceRevoked => "DEVICE_REVOKED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Uuid(_) => "INVALID_UUID",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Json(_) => "JSON_ERROR",
            AppError::Internal(_) | AppError::Unknown(_) => "INTERNAL_ERROR",
        }
    }

    /// User-facing message without internal details.
    pub fn user_message(&self) -> String {
        match self {
            AppError::RateLimited { retry_after_sec } => {
                format!("Too many requests. Retry after {} seconds", retry_after_sec)
            }
            AppError::AbuseBlocked { .. } => {
                "Suspicious activity detected. Please try again later.".to_string()
            }
            AppError::Validation(msg) => msg.clone(),
            AppError::RangeTooLarge { max, .. } => {
                format!("Requested range too large (max {})", max)
            }
            AppError::NotAuthorized(msg) => msg.clone(),
            AppError::DeviceRevoked => "Device revoked or not found".to_string(),
            AppError::Conflict(_) => "Conflicts with an existing resource".to_string(),
            AppError::NotFound(msg) => msg.clone(),
            AppError::Uuid(_) => "Invalid UUID format".to_string(),
            AppError::Database(_) | AppError::Json(_) => "Storage error".to_string(),
            AppError::Internal(_) | AppError::Unknown(_) => "Internal server error".to_string(),
        }
    }

    /// Log with a level matching severity. Admission rejections are expected
    /// traffic, not server faults.
    pub fn log(&self) {
        match self {
            AppError::RateLimited { .. } | AppError::AbuseBlocked { .. } => {
                tracing::warn!(code = self.error_code(), "admission rejection: {}", self)
            }
            AppError::Database(_) | AppError::Internal(_) | AppError::Unknown(_) => {
                tracing::error!(code = self.error_code(), "request failed: {}", self)
            }
            _ => tracing::debug!(code = self.error_code(), "request rejected: {}", self),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.log();

        let mut body = json!({
            "error": self.error_code(),
            "message": self.user_message(),
        });

        match &self {
            AppError::RateLimited { retry_after_sec } => {
                body["retry_after_sec"] = json!(retry_after_sec);
            }
            AppError::AbuseBlocked {
                risk_level,
                action,
                retry_after_sec,
            } => {
                body["risk_level"] = json!(risk_level.as_str());
                body["action"] = json!(action.as_str());
                if let Some(secs) = retry_after_sec {
                    body["retry_after_sec"] = json!(secs);
                }
            }
            _ => {}
        }

        let mut response = (self.status_code(), Json(body)).into_response();
        if let AppError::RateLimited { retry_after_sec } = &self {
            if let Ok(value) = retry_after_sec.to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_retryable_statuses() {
        let limited = AppError::RateLimited { retry_after_sec: 12 };
        assert_eq!(limited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.error_code(), "RATE_LIMITED");

        let locked = AppError::AbuseBlocked {
            risk_level: RiskLevel::Critical,
            action: AbuseAction::Locked,
            retry_after_sec: Some(600),
        };
        assert_eq!(locked.status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn range_guard_is_a_validation_error() {
        let err = AppError::RangeTooLarge {
            requested: 900,
            max: 500,
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.error_code(), "RANGE_TOO_LARGE");
    }

    #[test]
    fn user_messages_hide_internals() {
        let err = AppError::Internal("pool exhausted on shard 3".into());
        assert!(!err.user_message().contains("shard"));
    }
}
