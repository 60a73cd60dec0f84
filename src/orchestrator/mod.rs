//! Refresh Orchestrator (§4.4): the six-stage fetch/dedupe/transform/
//! persist pipeline, plus the reduced delta path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::exchange::ExchangeOps;
use crate::models::{Asset, AssetStatus, CancellationToken, Contract};
use crate::progress::ProgressHub;
use crate::rate_governor::RateGovernor;
use crate::store::{AssetStore, BulkUpsertEngine};
use crate::transform;

const TRANSFORM_BATCH_SIZE: usize = 100;
const TRANSFORM_MAX_CONCURRENT_BATCHES: usize = 5;
const TRANSFORM_PROGRESS_EVERY: u64 = 200;
const DELTA_ELIGIBLE_WINDOW_HOURS: i64 = 1;

#[derive(Debug, Clone, Default)]
pub struct RefreshOutcome {
    pub session_id: String,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
    pub skipped: u64,
    pub duplicates: u64,
    pub with_market_data: u64,
    pub without_market_data: u64,
    pub contracts_fetched: u64,
    pub status_distribution: HashMap<String, u64>,
    pub delta_mode: Option<&'static str>,
    pub duration_ms: u64,
}

/// A refresh aborted outright (rate-limit, empty upstream payload, or
/// cancellation) rather than completing with partial counts.
#[derive(Debug, Clone)]
pub enum RefreshAbort {
    RateLimited { recovery_seconds: u64 },
    Cancelled,
    Fatal(String),
}

pub struct RefreshOrchestrator {
    exchange: Arc<dyn ExchangeOps>,
    store: Arc<AssetStore>,
    hub: Arc<ProgressHub>,
    governor: Arc<RateGovernor>,
}

impl RefreshOrchestrator {
    pub fn new(exchange: Arc<dyn ExchangeOps>, store: Arc<AssetStore>, hub: Arc<ProgressHub>, governor: Arc<RateGovernor>) -> Self {
        Self {
            exchange,
            store,
            hub,
            governor,
        }
    }

    /// `POST /refresh/delta` entry point: runs the reduced market-data-only
    /// path when the store is fresh enough, otherwise falls through to a
    /// full refresh under the same session id (§4.4).
    pub async fn run_delta(&self, session_id: String, cancel: CancellationToken) -> Result<RefreshOutcome, RefreshAbort> {
        let started = Instant::now();
        self.stage_initialize(&session_id, &cancel)?;

        let eligible = self
            .store
            .most_recent_update()
            .map_err(|e| RefreshAbort::Fatal(e.to_string()))?
            .is_some_and(|ts| Utc::now() - ts <= chrono::Duration::hours(DELTA_ELIGIBLE_WINDOW_HOURS));

        if !eligible {
            info!(session_id, "store not fresh enough for delta, falling through to full refresh");
            return self.run_full_from(session_id, cancel, started).await;
        }

        self.hub.emit_progress(&session_id, "fetching market data", 10, 0, 0, None);
        let tickers = self.exchange.get_all_tickers().await.map_err(|e| self.classify_abort(&session_id, e))?;

        let now = Utc::now();
        let mut updates = Vec::with_capacity(tickers.len());
        for ticker in &tickers {
            let Some(symbol) = crate::symbol::normalize(&ticker.symbol) else {
                continue;
            };
            let mut asset = Asset {
                symbol,
                name: String::new(),
                base_currency: String::new(),
                quote_currency: String::new(),
                status: AssetStatus::Unknown,
                min_qty: 0.0,
                max_qty: 0.0,
                tick_size: 0.0,
                step_size: 0.0,
                max_leverage: 0.0,
                maint_margin_rate: 0.0,
                last_price: ticker.last_price,
                price_change_percent: ticker.price_change_percent,
                base_volume_24h: ticker.base_volume,
                quote_volume_24h: ticker.quote_volume,
                high_price_24h: ticker.high_price,
                low_price_24h: ticker.low_price,
                open_interest: ticker.open_interest,
                updated_at: now,
            };
            asset.sanitize();
            updates.push(asset);
        }

        if cancel.is_cancelled() {
            self.hub.emit_cancelled(&session_id);
            return Err(RefreshAbort::Cancelled);
        }

        let touched = self.store.update_market_state_batch(&updates).map_err(|e| RefreshAbort::Fatal(e.to_string()))?;

        let outcome = RefreshOutcome {
            session_id: session_id.clone(),
            updated: touched as u64,
            delta_mode: Some("MARKET_DATA_ONLY"),
            duration_ms: started.elapsed().as_millis() as u64,
            ..Default::default()
        };

        self.hub.emit_completed(&session_id, summary_json(&outcome));
        Ok(outcome)
    }

    /// `POST /refresh` entry point: the full six-stage pipeline (§4.4).
    pub async fn run_full(&self, session_id: String, cancel: CancellationToken) -> Result<RefreshOutcome, RefreshAbort> {
        let started = Instant::now();
        self.stage_initialize(&session_id, &cancel)?;
        self.run_full_from(session_id, cancel, started).await
    }

    async fn run_full_from(&self, session_id: String, cancel: CancellationToken, started: Instant) -> Result<RefreshOutcome, RefreshAbort> {
        let (contracts, tickers) = self.stage_fetch(&session_id, &cancel).await?;

        if contracts.is_empty() {
            let msg = "upstream returned zero contracts";
            self.hub.emit_error(&session_id, msg);
            return Err(RefreshAbort::Fatal(msg.to_string()));
        }

        self.check_cancel(&session_id, &cancel)?;
        let (deduped, duplicates) = self.stage_deduplicate(&session_id, contracts)?;

        self.check_cancel(&session_id, &cancel)?;
        let (assets, with_market_data, without_market_data) = self
            .stage_transform(&session_id, deduped, &tickers, &cancel)
            .await?;

        self.check_cancel(&session_id, &cancel)?;
        let mut status_distribution = HashMap::new();
        for asset in &assets {
            *status_distribution.entry(asset.status.as_str().to_string()).or_insert(0u64) += 1;
        }

        let persisted = self.stage_bulk_persist(&session_id, assets).await;

        let outcome = RefreshOutcome {
            session_id: session_id.clone(),
            created: persisted.created,
            updated: persisted.updated,
            errors: persisted.errors,
            skipped: persisted.skipped,
            duplicates,
            with_market_data,
            without_market_data,
            contracts_fetched: (with_market_data + without_market_data + duplicates),
            status_distribution,
            delta_mode: None,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        self.stage_finalize(&session_id, &outcome);
        Ok(outcome)
    }

    fn stage_initialize(&self, session_id: &str, cancel: &CancellationToken) -> Result<(), RefreshAbort> {
        self.check_cancel(session_id, cancel)?;
        self.governor.cache_invalidate("symbols");
        self.governor.cache_invalidate("tickers");
        self.hub.emit_progress(session_id, "starting", 0, 0, 0, None);
        Ok(())
    }

    async fn stage_fetch(&self, session_id: &str, cancel: &CancellationToken) -> Result<(Vec<Contract>, Vec<crate::models::Ticker>), RefreshAbort> {
        self.check_cancel(session_id, cancel)?;
        self.hub.emit_progress(session_id, "fetching contracts and tickers", 5, 0, 0, None);

        match self.exchange.get_symbols_and_tickers().await {
            Ok((contracts, tickers)) => Ok((contracts, tickers)),
            Err(err) if err.is_rate_limit() => Err(self.classify_abort(session_id, err)),
            Err(err) => {
                warn!(session_id, error = %err, "combined fetch failed, falling back to serial fetches");
                let contracts = self.exchange.get_symbols().await.map_err(|e| self.classify_abort(session_id, e))?;
                let tickers = match self.exchange.get_all_tickers().await {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(session_id, error = %e, "ticker fetch failed after fallback, proceeding without market data");
                        Vec::new()
                    }
                };
                Ok((contracts, tickers))
            }
        }
    }

    fn stage_deduplicate(&self, session_id: &str, contracts: Vec<Contract>) -> Result<(Vec<Contract>, u64), RefreshAbort> {
        self.hub.emit_progress(session_id, "deduplicating", 45, 0, contracts.len() as u64, None);
        let mut seen = std::collections::HashSet::new();
        let mut duplicates = 0u64;
        let mut deduped = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let key = contract.symbol.clone().unwrap_or_default();
            if seen.insert(key) {
                deduped.push(contract);
            } else {
                duplicates += 1;
            }
        }
        Ok((deduped, duplicates))
    }

    async fn stage_transform(
        &self,
        session_id: &str,
        contracts: Vec<Contract>,
        tickers: &[crate::models::Ticker],
        cancel: &CancellationToken,
    ) -> Result<(Vec<Asset>, u64, u64), RefreshAbort> {
        let total = contracts.len() as u64;
        let ticker_index = Arc::new(transform::index_tickers(tickers));
        let semaphore = Arc::new(Semaphore::new(TRANSFORM_MAX_CONCURRENT_BATCHES));
        let processed = Arc::new(AtomicU64::new(0));
        let now_millis = Utc::now().timestamp_millis();

        let mut handles = Vec::new();
        for (batch_index, batch) in contracts.chunks(TRANSFORM_BATCH_SIZE).enumerate() {
            if cancel.is_cancelled() {
                self.hub.emit_cancelled(session_id);
                return Err(RefreshAbort::Cancelled);
            }
            let batch = batch.to_vec();
            let semaphore = semaphore.clone();
            let ticker_index = ticker_index.clone();
            let processed = processed.clone();
            let hub = self.hub.clone();
            let session_id = session_id.to_string();
            let base_index = batch_index * TRANSFORM_BATCH_SIZE;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let mut out = Vec::with_capacity(batch.len());
                for (offset, contract) in batch.iter().enumerate() {
                    let asset = transform::contract_to_asset(contract, &ticker_index, base_index + offset, now_millis);
                    out.push(asset);
                }
                let done = processed.fetch_add(batch.len() as u64, Ordering::SeqCst) + batch.len() as u64;
                if done % TRANSFORM_PROGRESS_EVERY < batch.len() as u64 || done == total {
                    let pct = 55 + ((done as f64 / total.max(1) as f64) * 20.0) as u8;
                    hub.emit_progress(&session_id, "transforming contracts", pct.min(75), done, total, None);
                }
                out
            }));
        }

        let mut assets = Vec::with_capacity(total as usize);
        for handle in handles {
            match handle.await {
                Ok(batch_assets) => assets.extend(batch_assets),
                Err(join_err) => warn!(session_id, error = %join_err, "transform batch task panicked, dropping its rows"),
            }
        }

        let with_market_data = assets.iter().filter(|a| ticker_index.contains_key(&a.symbol)).count() as u64;
        let without_market_data = assets.len() as u64 - with_market_data;

        Ok((assets, with_market_data, without_market_data))
    }

    async fn stage_bulk_persist(&self, session_id: &str, assets: Vec<Asset>) -> crate::store::BulkUpsertOutcome {
        let total = assets.len();
        let hub = self.hub.clone();
        let session_id_owned = session_id.to_string();
        let engine = BulkUpsertEngine::new(&self.store);
        engine
            .bulk_upsert(assets, move |processed, _total| {
                let pct = 75 + ((processed as f64 / total.max(1) as f64) * 23.0) as u8;
                hub.emit_progress(&session_id_owned, "persisting batch", pct.min(98), processed as u64, total as u64, None);
            })
            .await
    }

    fn stage_finalize(&self, session_id: &str, outcome: &RefreshOutcome) {
        self.hub.emit_completed(session_id, summary_json(outcome));
    }

    fn check_cancel(&self, session_id: &str, cancel: &CancellationToken) -> Result<(), RefreshAbort> {
        if cancel.is_cancelled() {
            self.hub.emit_cancelled(session_id);
            return Err(RefreshAbort::Cancelled);
        }
        Ok(())
    }

    fn classify_abort(&self, session_id: &str, err: crate::error::ExchangeError) -> RefreshAbort {
        if let Some(recovery) = err.recovery_seconds() {
            self.hub.emit_error(session_id, &format!("rate limit active. Please wait {} minutes", recovery.div_ceil(60)));
            RefreshAbort::RateLimited { recovery_seconds: recovery }
        } else {
            self.hub.emit_error(session_id, &err.to_string());
            RefreshAbort::Fatal(err.to_string())
        }
    }
}

fn summary_json(outcome: &RefreshOutcome) -> serde_json::Value {
    json!({
        "created": outcome.created,
        "updated": outcome.updated,
        "errors": outcome.errors,
        "skipped": outcome.skipped,
        "duplicates": outcome.duplicates,
        "withMarketData": outcome.with_market_data,
        "withoutMarketData": outcome.without_market_data,
        "contractsFetched": outcome.contracts_fetched,
        "statusDistribution": outcome.status_distribution,
        "deltaMode": outcome.delta_mode,
        "durationMs": outcome.duration_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Ticker;

    #[test]
    fn summary_json_carries_core_counters() {
        let outcome = RefreshOutcome {
            session_id: "s1".to_string(),
            created: 3,
            updated: 1,
            duplicates: 2,
            ..Default::default()
        };
        let json = summary_json(&outcome);
        assert_eq!(json["created"], 3);
        assert_eq!(json["duplicates"], 2);
    }

    /// A fake upstream standing in for the Exchange Client so orchestrator
    /// scenario tests (§8) don't make real HTTP calls.
    struct FakeExchange {
        contracts: Vec<Contract>,
        tickers: Vec<Ticker>,
        combined_err: Option<ExchangeError>,
    }

    fn contract(symbol: &str) -> Contract {
        Contract {
            symbol: Some(symbol.to_string()),
            status: Some(1),
            ..Default::default()
        }
    }

    fn ticker(symbol: &str, last_price: f64) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last_price,
            ..Default::default()
        }
    }

    #[async_trait::async_trait]
    impl ExchangeOps for FakeExchange {
        async fn get_symbols(&self) -> Result<Vec<Contract>, ExchangeError> {
            Ok(self.contracts.clone())
        }

        async fn get_all_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
            Ok(self.tickers.clone())
        }

        async fn get_symbols_and_tickers(&self) -> Result<(Vec<Contract>, Vec<Ticker>), ExchangeError> {
            if let Some(err) = &self.combined_err {
                return Err(err.clone());
            }
            Ok((self.contracts.clone(), self.tickers.clone()))
        }
    }

    fn harness(exchange: FakeExchange) -> (tempfile::TempDir, RefreshOrchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(AssetStore::open(dir.path().join("orch.sqlite3").to_str().unwrap()).unwrap());
        let hub = ProgressHub::new();
        let governor = RateGovernor::new(false);
        let orchestrator = RefreshOrchestrator::new(Arc::new(exchange), store, hub, governor);
        (dir, orchestrator)
    }

    #[tokio::test]
    async fn happy_path_full_refresh_dedupes_and_persists() {
        let (_dir, orchestrator) = harness(FakeExchange {
            contracts: vec![contract("BTC-USDT"), contract("ETH-USDT"), contract("BTC-USDT")],
            tickers: vec![ticker("BTC-USDT", 65_000.0)],
            combined_err: None,
        });

        let outcome = orchestrator.run_full("s1".to_string(), CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.with_market_data, 1);
        assert_eq!(outcome.without_market_data, 1);
        assert_eq!(outcome.created + outcome.updated + outcome.errors + outcome.skipped, outcome.contracts_fetched - outcome.duplicates);
    }

    #[tokio::test]
    async fn zero_contracts_is_fatal_and_leaves_store_untouched() {
        let (_dir, orchestrator) = harness(FakeExchange {
            contracts: vec![],
            tickers: vec![],
            combined_err: None,
        });

        let result = orchestrator.run_full("s1".to_string(), CancellationToken::new()).await;
        assert!(matches!(result, Err(RefreshAbort::Fatal(_))));
    }

    #[tokio::test]
    async fn rate_limit_mid_fetch_aborts_with_recovery_seconds() {
        let (_dir, orchestrator) = harness(FakeExchange {
            contracts: vec![contract("BTC-USDT")],
            tickers: vec![],
            combined_err: Some(ExchangeError::RateLimit {
                recovery: std::time::Duration::from_secs(30),
            }),
        });

        let result = orchestrator.run_full("s1".to_string(), CancellationToken::new()).await;
        match result {
            Err(RefreshAbort::RateLimited { recovery_seconds }) => assert_eq!(recovery_seconds, 30),
            other => panic!("expected RateLimited abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_fetch_skips_the_pipeline_entirely() {
        let (_dir, orchestrator) = harness(FakeExchange {
            contracts: vec![contract("BTC-USDT")],
            tickers: vec![],
            combined_err: None,
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = orchestrator.run_full("s1".to_string(), cancel).await;
        assert!(matches!(result, Err(RefreshAbort::Cancelled)));
    }
}
