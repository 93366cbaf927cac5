// ============================================================================
// Abuse Engine
// ============================================================================
//
// Event-sourced per-user score with fixed escalation thresholds:
// - every adverse event appends a row and adds its weight to a capped score
// - crossing into CRITICAL arms a cooldown during which everything is locked
// - scores decay per hour of inactivity, so users recover on their own
//
// Gate ordering matters: an armed cooldown rejects regardless of what the
// score has decayed to in the meantime.
// ============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{
    ABUSE_MEDIUM_DELAY_MS, ABUSE_THRESHOLD_CRITICAL, ABUSE_THRESHOLD_HIGH, ABUSE_THRESHOLD_MEDIUM,
};
use crate::error::AbuseAction;
use crate::store::RelayStore;
use crate::types::{AbuseScore, RiskLevel};

pub fn risk_level_for(score: i32) -> RiskLevel {
    if score >= ABUSE_THRESHOLD_CRITICAL {
        RiskLevel::Critical
    } else if score >= ABUSE_THRESHOLD_HIGH {
        RiskLevel::High
    } else if score >= ABUSE_THRESHOLD_MEDIUM {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Outcome of the pre-action gate.
pub enum AbuseGate {
    Clear,
    /// Allowed, but the handler should stall before doing the work.
    Delayed { delay_ms: u64 },
    Blocked {
        risk_level: RiskLevel,
        action: AbuseAction,
        retry_after_sec: Option<i64>,
    },
}

pub struct AbuseEngine {
    store: Arc<dyn RelayStore>,
}

impl AbuseEngine {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Append an adverse event and fold its weight into the user's score.
    pub async fn record_event(
        &self,
        user_id: Uuid,
        device_id: Option<Uuid>,
        event_type: &str,
        weight: i32,
        now: DateTime<Utc>,
    ) -> Result<AbuseScore> {
        let score = self
            .store
            .apply_abuse_event(user_id, device_id, event_type, weight, now)
            .await?;
        tracing::info!(
            %user_id,
            event_type,
            weight,
            score = score.score,
            risk_level = score.risk_level.as_str(),
            "Recorded abuse event"
        );
        Ok(score)
    }

    /// Evaluate whether an action from this user may proceed.
    /// Cooldown wins over everything else; after it lapses the risk level is
    /// judged fresh against whatever the score has decayed to.
    pub async fn gate(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<AbuseGate> {
        let score = match self.store.abuse_score(user_id).await? {
            Some(score) => score,
            None => return Ok(AbuseGate::Clear),
        };

        if let Some(cooldown_until) = score.cooldown_until {
            if cooldown_until > now {
                return Ok(AbuseGate::Blocked {
                    risk_level: score.risk_level,
                    action: AbuseAction::Locked,
                    retry_after_sec: Some((cooldown_until - now).num_seconds().max(1)),
                });
            }
        }

        match score.risk_level {
            RiskLevel::Critical => Ok(AbuseGate::Blocked {
                risk_level: RiskLevel::Critical,
                action: AbuseAction::Blocked,
                retry_after_sec: None,
            }),
            RiskLevel::High => Ok(AbuseGate::Blocked {
                risk_level: RiskLevel::High,
                action: AbuseAction::Rejected,
                retry_after_sec: None,
            }),
            RiskLevel::Medium => Ok(AbuseGate::Delayed {
                delay_ms: ABUSE_MEDIUM_DELAY_MS,
            }),
            RiskLevel::Low => Ok(AbuseGate::Clear),
        }
    }
}
