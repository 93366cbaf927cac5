pub mod admission;
pub mod audit;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod devices;
pub mod error;
pub mod metrics;
pub mod push;
pub mod relay;
pub mod routes;
pub mod store;
pub mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;

use crate::context::AppContext;

/// Serve the relay until SIGINT/SIGTERM.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let port = ctx.config.port;
    cleanup::spawn_sweeper(
        ctx.store.clone(),
        ctx.config.sweeper.clone(),
        ctx.config.admission.max_window_secs(),
    );

    let router = routes::create_router(ctx);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    tracing::info!(port, "Relay server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
