// ============================================================================
// Admission Control
// ============================================================================
//
// Two gates consulted before any relay work happens:
// - RateLimiter: hard sliding-window limit per (identifier, endpoint)
// - AbuseEngine: soft, score-based gate layered underneath the rate limiter
//
// Both keep their state in the shared transactional store so every instance
// of the server sees the same counters.
// ============================================================================

pub mod abuse;
pub mod rate_limiter;

pub use abuse::{risk_level_for, AbuseEngine, AbuseGate};
pub use rate_limiter::{identifier_for, RateDecision, RateLimiter};

/// Abuse event types appended by the relay itself.
pub const EVENT_RATE_LIMIT_HIT: &str = "RATE_LIMIT_HIT";
pub const EVENT_REPAIR_ABUSE: &str = "REPAIR_ABUSE";
