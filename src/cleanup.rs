//! Background sweeper: expired mailbox entries, stale rate-limit events and
//! hourly abuse-score decay. One task, one interval; every pass is cheap and
//! any failure is logged and retried on the next tick.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::SweeperConfig;
use crate::store::RelayStore;

pub fn spawn_sweeper(store: Arc<dyn RelayStore>, config: SweeperConfig, rate_window_secs: i64) {
    let interval = std::time::Duration::from_secs(config.interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(store.as_ref(), Utc::now(), rate_window_secs).await {
                tracing::error!(error = %e, "Sweeper pass failed");
            }
        }
    });
}

/// One sweep pass. `rate_window_secs` is the widest configured rate-limit
/// window; only events already outside it are deleted.
pub async fn sweep_once(
    store: &dyn RelayStore,
    now: DateTime<Utc>,
    rate_window_secs: i64,
) -> anyhow::Result<()> {
    let purged = store.purge_expired(now).await?;
    let swept = store
        .sweep_rate_events(now - Duration::seconds(rate_window_secs))
        .await?;
    let decayed = store.decay_abuse_scores(now).await?;

    if purged > 0 || swept > 0 || decayed > 0 {
        tracing::info!(purged, swept, decayed, "Sweeper pass complete");
    }
    Ok(())
}
