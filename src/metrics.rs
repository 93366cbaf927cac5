use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, TextEncoder, opts, register_histogram, register_int_counter,
};

pub static MESSAGES_SEQUENCED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_messages_sequenced_total",
        "Messages assigned a fresh server sequence number"
    ))
    .unwrap()
});

pub static MESSAGES_DUPLICATE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_messages_duplicate_total",
        "Sends short-circuited by the idempotency layer"
    ))
    .unwrap()
});

pub static FANOUT_ENTRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_fanout_entries_total",
        "Per-device mailbox entries written during fanout"
    ))
    .unwrap()
});

pub static FANOUT_SKIPPED_NO_SESSION_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_fanout_skipped_no_session_total",
        "Fanout copies skipped because no session key exists for the device pair"
    ))
    .unwrap()
});

pub static FANOUT_SKIPPED_REVOKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_fanout_skipped_revoked_total",
        "Fanout copies dropped because the device lost trust mid-fanout"
    ))
    .unwrap()
});

pub static RATE_LIMITED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_rate_limited_total",
        "Requests rejected by the sliding-window rate limiter"
    ))
    .unwrap()
});

pub static ABUSE_BLOCKED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_abuse_blocked_total",
        "Requests rejected by the abuse engine"
    ))
    .unwrap()
});

pub static REPAIR_REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "relay_repair_requests_total",
        "Gap repair requests served"
    ))
    .unwrap()
});

pub static SEND_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "relay_send_latency_seconds",
        "End-to-end latency of the send pipeline"
    )
    .unwrap()
});

pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
