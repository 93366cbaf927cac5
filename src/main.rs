use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_server::config::Config;
use relay_server::context::AppContext;
use relay_server::push::{HttpWakeGateway, NoopWakeGateway, WakeGateway};
use relay_server::store::PostgresStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "relay_server=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store = PostgresStore::connect(&config.db).await?;
    store.migrate().await?;
    tracing::info!("Database connected, migrations applied");

    let wake: Arc<dyn WakeGateway> = if config.push.enabled {
        Arc::new(HttpWakeGateway::new(&config.push)?)
    } else {
        tracing::info!("Push gateway disabled, wake notifications will be dropped");
        Arc::new(NoopWakeGateway)
    };

    let ctx = Arc::new(AppContext::new(config, Arc::new(store), wake));
    relay_server::run(ctx).await
}
