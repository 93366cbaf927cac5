// ============================================================================
// Rate Limiter
// ============================================================================
//
// Sliding-window limiter over the shared store:
// - One event row per admitted request, keyed by (identifier, endpoint)
// - A request is rejected when the trailing window already holds `limit` rows
// - retry_after is computed from the oldest event still inside the window
//
// Old rows are swept probabilistically (roughly one sweep per
// `gc_denominator` admitted requests) plus by the background sweeper.
// ============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::config::RateLimitRule;
use crate::store::RelayStore;

pub enum RateDecision {
    Allowed,
    Denied { retry_after_sec: i64 },
}

/// The identity a request is throttled under. The same user on two devices
/// gets two independent budgets; an unauthenticated caller falls back to IP.
pub fn identifier_for(device_id: Option<Uuid>, user_id: Option<Uuid>, ip: &str) -> String {
    if let Some(device) = device_id {
        format!("device:{}", device)
    } else if let Some(user) = user_id {
        format!("user:{}", user)
    } else {
        format!("ip:{}", ip)
    }
}

pub struct RateLimiter {
    store: Arc<dyn RelayStore>,
    gc_denominator: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RelayStore>, gc_denominator: u32) -> Self {
        Self {
            store,
            gc_denominator: gc_denominator.max(1),
        }
    }

    /// Count the trailing window, then either reject or record.
    ///
    /// The count-then-insert pair is not atomic, so a burst racing the check
    /// can land slightly over `limit`. The window still bounds throughput;
    /// exact admission is not a goal here.
    pub async fn check_and_record(
        &self,
        identifier: &str,
        endpoint: &str,
        rule: &RateLimitRule,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let window = Duration::seconds(rule.window_secs);
        let window_start = now - window;

        let count = self
            .store
            .count_rate_events(identifier, endpoint, window_start)
            .await?;

        if count >= rule.limit {
            let oldest = self
                .store
                .oldest_rate_event(identifier, endpoint, window_start)
                .await?;
            let retry_after_sec = oldest
                .map(|at| (at + window - now).num_seconds())
                .unwrap_or(rule.window_secs)
                .max(1);
            return Ok(RateDecision::Denied { retry_after_sec });
        }

        self.store.record_rate_event(identifier, endpoint, now).await?;

        if rand::thread_rng().gen_range(0..self.gc_denominator) == 0 {
            let swept = self.store.sweep_rate_events(window_start).await?;
            if swept > 0 {
                tracing::debug!(swept, "Swept expired rate limit events");
            }
        }

        Ok(RateDecision::Allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), 100)
    }

    #[tokio::test]
    async fn test_identifier_precedence() {
        let device = Uuid::new_v4();
        let user = Uuid::new_v4();

        assert!(identifier_for(Some(device), Some(user), "1.2.3.4").starts_with("device:"));
        assert!(identifier_for(None, Some(user), "1.2.3.4").starts_with("user:"));
        assert_eq!(identifier_for(None, None, "1.2.3.4"), "ip:1.2.3.4");
    }

    #[tokio::test]
    async fn test_limit_boundary() {
        let limiter = limiter();
        let rule = RateLimitRule {
            limit: 3,
            window_secs: 60,
        };
        let now = Utc::now();

        for _ in 0..3 {
            let decision = limiter
                .check_and_record("device:x", "send", &rule, now)
                .await
                .unwrap();
            assert!(matches!(decision, RateDecision::Allowed));
        }

        let decision = limiter
            .check_and_record("device:x", "send", &rule, now)
            .await
            .unwrap();
        match decision {
            RateDecision::Denied { retry_after_sec } => assert!(retry_after_sec >= 1),
            RateDecision::Allowed => panic!("fourth request should have been denied"),
        }
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = limiter();
        let rule = RateLimitRule {
            limit: 2,
            window_secs: 60,
        };
        let start = Utc::now();

        for _ in 0..2 {
            limiter
                .check_and_record("device:y", "send", &rule, start)
                .await
                .unwrap();
        }

        // Inside the window: denied.
        let decision = limiter
            .check_and_record("device:y", "send", &rule, start + Duration::seconds(30))
            .await
            .unwrap();
        assert!(matches!(decision, RateDecision::Denied { .. }));

        // Past the window: the old events no longer count.
        let decision = limiter
            .check_and_record("device:y", "send", &rule, start + Duration::seconds(61))
            .await
            .unwrap();
        assert!(matches!(decision, RateDecision::Allowed));
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let limiter = limiter();
        let rule = RateLimitRule {
            limit: 1,
            window_secs: 60,
        };
        let now = Utc::now();

        limiter
            .check_and_record("device:z", "send", &rule, now)
            .await
            .unwrap();

        let decision = limiter
            .check_and_record("device:z", "pull", &rule, now)
            .await
            .unwrap();
        assert!(matches!(decision, RateDecision::Allowed));
    }
}
