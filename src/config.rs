use anyhow::{Context, Result};

// ============================================================================
// Configuration Constants
// ============================================================================

const DEFAULT_PORT: u16 = 8080;

// Repair protocol: bound on (end_seq - start_seq + 1) for one request.
pub const REPAIR_MAX_RANGE: i64 = 500;

// Pull pagination defaults.
pub const DEFAULT_PULL_LIMIT: i64 = 100;
pub const MAX_PULL_LIMIT: i64 = 1000;

// Mailbox entries expire after 30 days unless terminally delivered first.
pub const MAILBOX_TTL_SECS: i64 = 30 * 24 * 3600;

// Abuse engine thresholds.
pub const ABUSE_THRESHOLD_MEDIUM: i32 = 50;
pub const ABUSE_THRESHOLD_HIGH: i32 = 100;
pub const ABUSE_THRESHOLD_CRITICAL: i32 = 150;
pub const ABUSE_SCORE_CAP: i32 = 500;
pub const ABUSE_COOLDOWN_SECS: i64 = 30 * 60;
// Points removed per hour of inactivity.
pub const ABUSE_DECAY_PER_HOUR: i32 = 10;
// Artificial delay applied to MEDIUM-risk senders.
pub const ABUSE_MEDIUM_DELAY_MS: u64 = 1000;

// Abuse event weights fed by admission control itself.
pub const ABUSE_WEIGHT_RATE_LIMIT_HIT: i32 = 10;
pub const ABUSE_WEIGHT_REPAIR_ABUSE: i32 = 25;

// Payload ceiling: ciphertext plus crypto metadata. Larger blobs belong on
// the media path, not the relay.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

// ============================================================================
// Configuration Structures
// ============================================================================

/// Database connection pool configuration.
#[derive(Clone, Debug)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

/// Per-endpoint sliding-window rate limits (count per window).
#[derive(Clone, Debug)]
pub struct RateLimitRule {
    pub limit: i64,
    pub window_secs: i64,
}

/// Admission control policy: hard rate limits plus the soft abuse gate.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub send: RateLimitRule,
    pub pull: RateLimitRule,
    pub repair: RateLimitRule,
    pub receipt: RateLimitRule,
    /// Probability denominator for inline rate-event GC (1/N requests).
    pub gc_denominator: u32,
}

/// Push/wake gateway configuration. Disabled by default; delivery is
/// fire-and-forget either way.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub enabled: bool,
    pub base_url: String,
    pub timeout_secs: u64,
}

/// Background sweeper cadence.
#[derive(Clone, Debug)]
pub struct SweeperConfig {
    pub interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub db: DbConfig,
    pub admission: AdmissionConfig,
    pub push: PushConfig,
    pub sweeper: SweeperConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {}: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Loads configuration from the environment, with production-safe
    /// defaults for everything except DATABASE_URL.
    pub fn from_env() -> Result<Self> {
        let db = DbConfig {
            url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", 10)?,
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 5)?,
        };

        let admission = AdmissionConfig {
            send: RateLimitRule {
                limit: env_or("RATE_LIMIT_SEND", 30)?,
                window_secs: env_or("RATE_LIMIT_SEND_WINDOW_SECS", 60)?,
            },
            pull: RateLimitRule {
                limit: env_or("RATE_LIMIT_PULL", 120)?,
                window_secs: env_or("RATE_LIMIT_PULL_WINDOW_SECS", 60)?,
            },
            repair: RateLimitRule {
                limit: env_or("RATE_LIMIT_REPAIR", 30)?,
                window_secs: env_or("RATE_LIMIT_REPAIR_WINDOW_SECS", 60)?,
            },
            receipt: RateLimitRule {
                limit: env_or("RATE_LIMIT_RECEIPT", 60)?,
                window_secs: env_or("RATE_LIMIT_RECEIPT_WINDOW_SECS", 60)?,
            },
            gc_denominator: env_or("RATE_LIMIT_GC_DENOMINATOR", 100)?,
        };

        let push = PushConfig {
            enabled: env_or("PUSH_ENABLED", false)?,
            base_url: std::env::var("PUSH_GATEWAY_URL").unwrap_or_default(),
            timeout_secs: env_or("PUSH_TIMEOUT_SECS", 3)?,
        };

        let sweeper = SweeperConfig {
            interval_secs: env_or("SWEEPER_INTERVAL_SECS", 300)?,
        };

        Ok(Config {
            port: env_or("PORT", DEFAULT_PORT)?,
            db,
            admission,
            push,
            sweeper,
        })
    }
}

impl AdmissionConfig {
    /// Widest configured window. Rate events older than this are outside
    /// every window and safe for the sweeper to delete.
    pub fn max_window_secs(&self) -> i64 {
        self.send
            .window_secs
            .max(self.pull.window_secs)
            .max(self.repair.window_secs)
            .max(self.receipt.window_secs)
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            send: RateLimitRule {
                limit: 30,
                window_secs: 60,
            },
            pull: RateLimitRule {
                limit: 120,
                window_secs: 60,
            },
            repair: RateLimitRule {
                limit: 30,
                window_secs: 60,
            },
            receipt: RateLimitRule {
                limit: 60,
                window_secs: 60,
            },
            gc_denominator: 100,
        }
    }
}
