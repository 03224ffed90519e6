use std::sync::Arc;

use flow::runtime::CatalogStateStore;
use flow::{EngineOptions, FlowEngine, FlowableActivity};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let catalog_config = catalog::CatalogConfig::from_env()?;
    let catalog = Arc::new(catalog::Catalog::new(&catalog_config).await?);
    tracing::info!("connected to catalog");

    let activities = FlowableActivity::new(Some(catalog.clone()));
    let store = Arc::new(CatalogStateStore::new(catalog));
    let engine = FlowEngine::new(activities, store, EngineOptions::default());
    let handler = server::FlowRequestHandler::new(engine);

    tracing::info!("flow worker ready: {}", handler.health_check());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down flow worker");
    Ok(())
}
