// ============================================================================
// Axum Routes Module
// ============================================================================
//
// Structure:
// - mod.rs: router assembly and middleware stack
// - relay.rs: send / pull / repair / receipt / inbox
// - devices.rs: registration and trust lifecycle
// - health.rs: health check and metrics endpoints
// - extractors.rs: authenticated-device extractor, client IP helper
// - middleware.rs: request correlation and logging
//
// ============================================================================

mod devices;
mod extractors;
mod health;
mod middleware;
mod relay;

pub use extractors::AuthenticatedDevice;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health and monitoring
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        // Relay engine
        .route("/relay/send", post(relay::send))
        .route("/relay/pull", get(relay::pull))
        .route("/relay/repair", get(relay::repair))
        .route("/relay/receipt", post(relay::receipt))
        .route("/relay/inbox", get(relay::inbox))
        // Device registry
        .route("/devices", get(devices::list))
        .route("/devices/register", post(devices::register))
        .route("/devices/:device_id/approve", post(devices::approve))
        .route("/devices/:device_id/revoke", post(devices::revoke))
        .route("/devices/session", post(devices::establish_session))
        // Order matters: last added runs first.
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(middleware::request_correlation))
                .layer(axum::middleware::from_fn(middleware::request_logging))
                .into_inner(),
        )
        .with_state(ctx)
}
