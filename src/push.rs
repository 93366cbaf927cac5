// ============================================================================
// Push / Wake Gateway
// ============================================================================
//
// Fire-and-forget wake signal after a successful fanout. Nothing in the
// relay orders on it: a lost wake only means the device finds its mailbox
// entries on the next poll. Payloads carry no message content, only the
// device to wake.
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::config::PushConfig;

#[async_trait::async_trait]
pub trait WakeGateway: Send + Sync {
    async fn wake(&self, device_id: Uuid) -> Result<()>;
}

#[derive(Serialize)]
struct WakeRequest {
    device_id: Uuid,
}

pub struct HttpWakeGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWakeGateway {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build push HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl WakeGateway for HttpWakeGateway {
    async fn wake(&self, device_id: Uuid) -> Result<()> {
        let url = format!("{}/wake", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&WakeRequest { device_id })
            .send()
            .await
            .context("Push gateway unreachable")?;

        if !response.status().is_success() {
            anyhow::bail!("Push gateway returned {}", response.status());
        }
        Ok(())
    }
}

/// Used when push is disabled and in tests.
pub struct NoopWakeGateway;

#[async_trait::async_trait]
impl WakeGateway for NoopWakeGateway {
    async fn wake(&self, _device_id: Uuid) -> Result<()> {
        Ok(())
    }
}

/// Spawn the wake without awaiting it; failures are logged and dropped.
pub fn wake_detached(gateway: Arc<dyn WakeGateway>, device_id: Uuid) {
    tokio::spawn(async move {
        if let Err(e) = gateway.wake(device_id).await {
            tracing::warn!(%device_id, error = %e, "Wake notification failed");
        }
    });
}
