use std::sync::Arc;

use crate::admission::{AbuseEngine, RateLimiter};
use crate::config::Config;
use crate::devices::DeviceRegistry;
use crate::push::WakeGateway;
use crate::relay::RelayEngine;
use crate::store::RelayStore;

/// Shared per-process state handed to every request handler.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn RelayStore>,
    pub engine: RelayEngine,
    pub devices: DeviceRegistry,
    pub rate_limiter: RateLimiter,
    pub abuse: AbuseEngine,
}

impl AppContext {
    pub fn new(config: Config, store: Arc<dyn RelayStore>, wake: Arc<dyn WakeGateway>) -> Self {
        let engine = RelayEngine::new(store.clone(), wake);
        let devices = DeviceRegistry::new(store.clone());
        let rate_limiter = RateLimiter::new(store.clone(), config.admission.gc_denominator);
        let abuse = AbuseEngine::new(store.clone());
        Self {
            config,
            store,
            engine,
            devices,
            rate_limiter,
            abuse,
        }
    }
}
