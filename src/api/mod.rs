//! HTTP surface (§6.1): the operational subset of routes sitting on top
//! of the refresh pipeline. Routing and middleware only - the pipeline
//! itself lives in the other modules.

mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::exchange::ExchangeOps;
use crate::orchestrator::RefreshOrchestrator;
use crate::progress::ProgressHub;
use crate::rate_governor::RateGovernor;
use crate::store::AssetStore;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<AssetStore>,
    pub hub: Arc<ProgressHub>,
    pub governor: Arc<RateGovernor>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub exchange: Arc<dyn ExchangeOps>,
}

pub fn router(state: AppState, config: &Config) -> Router {
    let mut cors = CorsLayer::new().allow_methods(tower_http::cors::Any);
    cors = match config.frontend_url.as_deref().filter(|s| !s.is_empty()).and_then(|o| o.parse::<axum::http::HeaderValue>().ok()) {
        Some(header_value) => cors.allow_origin(header_value),
        None => cors.allow_origin(tower_http::cors::Any),
    };

    Router::new()
        .route("/refresh", post(handlers::start_refresh))
        .route("/refresh/delta", post(handlers::start_delta_refresh))
        .route("/refresh/progress/:session_id", get(handlers::progress_stream))
        .route("/", get(handlers::list_assets))
        .route("/all", get(handlers::list_all_assets))
        .route("/stats/overview", get(handlers::stats_overview))
        .route("/cache/invalidate", post(handlers::invalidate_cache))
        .route("/clear", delete(handlers::clear_store))
        .route("/:symbol", get(handlers::get_asset))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
