use std::convert::Infallible;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::models::CancellationToken;
use crate::orchestrator::RefreshAbort;
use crate::progress::Frame;
use crate::store::{AssetFilter, SortOrder};

use super::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBody {
    #[serde(default)]
    pub session_id: Option<String>,
}

fn new_session_id() -> String {
    format!("refresh_{}", chrono::Utc::now().timestamp_millis())
}

/// The request body is optional (`{sessionId?}`, §6.1): an empty or
/// unparsable body falls back to `RefreshBody::default()` rather than
/// rejecting the request.
fn parse_refresh_body(bytes: &[u8]) -> RefreshBody {
    if bytes.is_empty() {
        return RefreshBody::default();
    }
    serde_json::from_slice(bytes).unwrap_or_default()
}

pub async fn start_refresh(State(state): State<AppState>, bytes: Bytes) -> impl IntoResponse {
    let session_id = parse_refresh_body(&bytes).session_id.unwrap_or_else(new_session_id);
    let cancel = CancellationToken::new();

    match state.orchestrator.run_full(session_id.clone(), cancel).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "created": outcome.created,
                    "updated": outcome.updated,
                    "total": outcome.created + outcome.updated,
                    "processed": outcome.with_market_data + outcome.without_market_data,
                    "statusDistribution": outcome.status_distribution,
                    "sessionId": outcome.session_id,
                }
            })),
        )
            .into_response(),
        Err(RefreshAbort::RateLimited { recovery_seconds }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "success": false, "recoveryMinutes": recovery_seconds.div_ceil(60) })),
        )
            .into_response(),
        Err(other) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("{other:?}") })),
        )
            .into_response(),
    }
}

pub async fn start_delta_refresh(State(state): State<AppState>, bytes: Bytes) -> impl IntoResponse {
    let session_id = parse_refresh_body(&bytes).session_id.unwrap_or_else(new_session_id);
    let cancel = CancellationToken::new();
    let started = std::time::Instant::now();

    match state.orchestrator.run_delta(session_id.clone(), cancel).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": {
                    "message": "delta refresh complete",
                    "updated": outcome.updated,
                    "created": outcome.created,
                    "total": outcome.created + outcome.updated,
                    "sessionId": outcome.session_id,
                    "deltaMode": outcome.delta_mode,
                    "executionTime": started.elapsed().as_millis() as u64,
                }
            })),
        )
            .into_response(),
        Err(RefreshAbort::RateLimited { recovery_seconds }) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({ "success": false, "recoveryMinutes": recovery_seconds.div_ceil(60) })),
        )
            .into_response(),
        Err(other) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("{other:?}") })),
        )
            .into_response(),
    }
}

pub async fn progress_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.hub.subscribe(session_id);
    let stream = ReceiverStream::new(rx).map(|frame| {
        let event = match frame {
            Frame::Event(value) => Event::default().data(value.to_string()),
            Frame::KeepAlive => Event::default().comment(""),
        };
        Ok(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(30))
            .text(""),
    )
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<i64>,
    limit: Option<i64>,
    #[serde(rename = "sortBy")]
    sort_by: Option<String>,
    #[serde(rename = "sortOrder")]
    sort_order: Option<String>,
    search: Option<String>,
    status: Option<String>,
}

fn parse_order(s: Option<&str>) -> SortOrder {
    match s.map(str::to_ascii_lowercase).as_deref() {
        Some("desc") => SortOrder::Desc,
        _ => SortOrder::Asc,
    }
}

fn build_filter(q: &ListQuery) -> AssetFilter {
    AssetFilter {
        search: q.search.clone().filter(|s| !s.is_empty()),
        status: q.status.as_deref().map(crate::models::AssetStatus::from_str_loose),
    }
}

pub async fn list_assets(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    let page = q.page.unwrap_or(1).max(1);
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let sort_by = q.sort_by.clone().unwrap_or_else(|| "symbol".to_string());
    let order = parse_order(q.sort_order.as_deref());
    let filter = build_filter(&q);

    let offset = (page - 1) * limit;
    let assets = match state.store.find_all(&filter, &sort_by, order, limit, offset) {
        Ok(a) => a,
        Err(err) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response();
        }
    };
    let total = state.store.count(&filter).unwrap_or(0);

    (
        StatusCode::OK,
        Json(json!({
            "assets": assets,
            "pagination": {
                "page": page,
                "limit": limit,
                "total": total,
                "totalPages": (total as f64 / limit as f64).ceil() as i64,
            }
        })),
    )
        .into_response()
}

pub async fn list_all_assets(State(state): State<AppState>, Query(q): Query<ListQuery>) -> impl IntoResponse {
    let sort_by = q.sort_by.clone().unwrap_or_else(|| "symbol".to_string());
    let order = parse_order(q.sort_order.as_deref());
    let filter = build_filter(&q);

    let started = std::time::Instant::now();
    let assets = match state.store.find_all(&filter, &sort_by, order, i64::MAX, 0) {
        Ok(a) => a,
        Err(err) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    };
    let last_updated = assets.iter().map(|a| a.updated_at).max();

    (
        StatusCode::OK,
        Json(json!({
            "assets": &assets,
            "count": assets.len(),
            "executionTime": started.elapsed().as_millis() as u64,
            "lastUpdated": last_updated,
        })),
    )
        .into_response()
}

pub async fn get_asset(State(state): State<AppState>, Path(symbol): Path<String>) -> impl IntoResponse {
    let Some(normalized) = crate::symbol::normalize(&symbol) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid symbol" }))).into_response();
    };
    match state.store.find_by_symbol(&normalized) {
        Ok(Some(asset)) => (StatusCode::OK, Json(json!({ "data": asset }))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

pub async fn stats_overview(State(state): State<AppState>) -> impl IntoResponse {
    let total_assets = state.store.count(&AssetFilter::default()).unwrap_or(0);
    let trading_assets = state.store.count_trading().unwrap_or(0);
    let top_gainers = state.store.top_by("price_change_percent", SortOrder::Desc, 5).unwrap_or_default();
    let top_losers = state.store.top_by("price_change_percent", SortOrder::Asc, 5).unwrap_or_default();
    let top_volume = state.store.top_by("quote_volume_24h", SortOrder::Desc, 5).unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "totalAssets": total_assets,
            "tradingAssets": trading_assets,
            "topGainers": top_gainers,
            "topLosers": top_losers,
            "topVolume": top_volume,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct InvalidateBody {
    pattern: String,
}

pub async fn invalidate_cache(State(state): State<AppState>, Json(body): Json<InvalidateBody>) -> impl IntoResponse {
    let invalidated = state.governor.cache_invalidate(&body.pattern);
    (
        StatusCode::OK,
        Json(json!({ "pattern": body.pattern, "invalidatedKeys": invalidated })),
    )
}

pub async fn clear_store(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.truncate() {
        Ok(deleted_count) => (StatusCode::OK, Json(json!({ "deletedCount": deleted_count }))).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

