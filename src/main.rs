use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use perpfeed::api::{self, AppState};
use perpfeed::config::Config;
use perpfeed::exchange::{ExchangeClient, ExchangeConfig};
use perpfeed::logging;
use perpfeed::orchestrator::RefreshOrchestrator;
use perpfeed::progress::ProgressHub;
use perpfeed::rate_governor::RateGovernor;
use perpfeed::store::AssetStore;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();

    let config = Config::from_env()?;
    info!(port = config.port, demo_mode = config.demo_mode, "starting perpfeed");

    if config.auto_start_bot {
        info!("AUTO_START_BOT set; trading bot collaborator is out of scope for this process");
    }

    let db_path = config.resolve_database_path()?;
    let store = Arc::new(AssetStore::open(&db_path)?);

    let governor = RateGovernor::new(config.is_dev());
    let exchange = Arc::new(ExchangeClient::new(
        governor.clone(),
        ExchangeConfig {
            demo_mode: config.demo_mode,
            api_key: config.bingx_api_key.clone(),
            secret_key: config.bingx_secret_key.clone(),
        },
    ));
    let hub = ProgressHub::new();
    let orchestrator = Arc::new(RefreshOrchestrator::new(exchange.clone(), store.clone(), hub.clone(), governor.clone()));

    let state = AppState {
        store,
        hub,
        governor,
        orchestrator,
        exchange,
    };

    let app = api::router(state, &config);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
