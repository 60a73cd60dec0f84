//! Exchange Client (§4.2): typed operations over the upstream REST
//! surface, with endpoint ranking, fallback chains, and request signing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::ExchangeError;
use crate::models::{Contract, Ticker};
use crate::rate_governor::{Priority, RateCategory, RateGovernor};

use super::auth::{canonical_query, sign};
use super::endpoints::EndpointSet;
use super::types::{Balance, Depth, Kline, OrderAck, OrderRequest, Position};

const LIVE_BASE_URL: &str = "https://open-api.bingx.com";
const DEMO_BASE_URL: &str = "https://open-api-vst.bingx.com";

const SYMBOLS_TIMEOUT: Duration = Duration::from_secs(15);
const COMBINED_TIMEOUT: Duration = Duration::from_secs(20);
const FALLBACK_SPACING: Duration = Duration::from_secs(1);

/// §7 retry attempt caps: NETWORK/SERVER/UNKNOWN errors are retried with
/// backoff up to this many rounds, market-data and account categories
/// tracked separately since account calls are scarcer and worth retrying
/// harder.
const MARKET_DATA_MAX_ATTEMPTS: u32 = 3;
const ACCOUNT_MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_JITTER_MAX_MS: u64 = 250;

const SYMBOLS_CACHE_KEY: &str = "symbols";
const TICKERS_CACHE_KEY: &str = "tickers";
const COMBINED_CACHE_KEY: &str = "symbols_and_tickers";
const SYMBOLS_CACHE_TTL: Duration = Duration::from_secs(60);
const TICKERS_CACHE_TTL: Duration = Duration::from_secs(5);
const COMBINED_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub demo_mode: bool,
    pub api_key: Option<String>,
    pub secret_key: Option<String>,
}

/// The subset of Exchange Client operations the Refresh Orchestrator
/// depends on, pulled out as a trait so orchestrator tests can inject a
/// fake upstream instead of making real HTTP calls (§8 scenario tests).
#[async_trait::async_trait]
pub trait ExchangeOps: Send + Sync {
    async fn get_symbols(&self) -> Result<Vec<Contract>, ExchangeError>;
    async fn get_all_tickers(&self) -> Result<Vec<Ticker>, ExchangeError>;
    async fn get_symbols_and_tickers(&self) -> Result<(Vec<Contract>, Vec<Ticker>), ExchangeError>;
}

#[async_trait::async_trait]
impl ExchangeOps for ExchangeClient {
    async fn get_symbols(&self) -> Result<Vec<Contract>, ExchangeError> {
        ExchangeClient::get_symbols(self).await
    }

    async fn get_all_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        ExchangeClient::get_all_tickers(self).await
    }

    async fn get_symbols_and_tickers(&self) -> Result<(Vec<Contract>, Vec<Ticker>), ExchangeError> {
        ExchangeClient::get_symbols_and_tickers(self).await
    }
}

pub struct ExchangeClient {
    http: reqwest::Client,
    governor: Arc<RateGovernor>,
    config: ExchangeConfig,
    endpoints: Mutex<HashMap<&'static str, EndpointSet>>,
}

impl ExchangeClient {
    pub fn new(governor: Arc<RateGovernor>, config: ExchangeConfig) -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert("symbols", EndpointSet::new(["/openApi/swap/v2/quote/contracts", "/openApi/swap/v1/quote/contracts"]));
        endpoints.insert("tickers", EndpointSet::new(["/openApi/swap/v2/quote/ticker", "/openApi/swap/v1/quote/ticker"]));
        endpoints.insert("ticker", EndpointSet::new(["/openApi/swap/v2/quote/ticker"]));
        endpoints.insert("positions", EndpointSet::new(["/openApi/swap/v2/user/positions"]));
        endpoints.insert("balance", EndpointSet::new(["/openApi/swap/v2/user/balance"]));
        endpoints.insert("order.place", EndpointSet::new(["/openApi/swap/v2/trade/order"]));
        endpoints.insert("order.cancel", EndpointSet::new(["/openApi/swap/v2/trade/order"]));
        endpoints.insert("klines", EndpointSet::new(["/openApi/swap/v3/quote/klines", "/openApi/swap/v2/quote/klines"]));
        endpoints.insert("depth", EndpointSet::new(["/openApi/swap/v2/quote/depth"]));
        endpoints.insert("userDataStream", EndpointSet::new(["/openApi/user/auth/userDataStream"]));

        Self {
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client builds with default TLS config"),
            governor,
            config,
            endpoints: Mutex::new(endpoints),
        }
    }

    fn base_url(&self) -> &'static str {
        if self.config.demo_mode {
            DEMO_BASE_URL
        } else {
            LIVE_BASE_URL
        }
    }

    /// `GET /symbols` - the Symbols endpoint (§4.2).
    pub async fn get_symbols(&self) -> Result<Vec<Contract>, ExchangeError> {
        if let Some(cached) = self.governor.cache_get(SYMBOLS_CACHE_KEY) {
            return parse_data_array::<Contract>(&cached);
        }
        let body = self
            .call_with_fallback("symbols", RateCategory::MarketData, Priority::High, &[], false, SYMBOLS_TIMEOUT)
            .await?;
        self.governor.cache_put(SYMBOLS_CACHE_KEY.to_string(), body.clone(), SYMBOLS_CACHE_TTL);
        parse_data_array::<Contract>(&body)
    }

    /// `GET /tickers` - the Tickers endpoint, all symbols (§4.2).
    pub async fn get_all_tickers(&self) -> Result<Vec<Ticker>, ExchangeError> {
        if let Some(cached) = self.governor.cache_get(TICKERS_CACHE_KEY) {
            return parse_data_array::<Ticker>(&cached);
        }
        let body = self
            .call_with_fallback("tickers", RateCategory::MarketData, Priority::High, &[], false, SYMBOLS_TIMEOUT)
            .await?;
        self.governor.cache_put(TICKERS_CACHE_KEY.to_string(), body.clone(), TICKERS_CACHE_TTL);
        parse_data_array::<Ticker>(&body)
    }

    pub async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let cache_key = format!("ticker:{symbol}");
        if let Some(cached) = self.governor.cache_get(&cache_key) {
            return parse_data::<Ticker>(&cached);
        }
        let params = [("symbol", symbol.to_string())];
        let body = self
            .call_with_fallback("ticker", RateCategory::MarketData, Priority::Medium, &params, false, SYMBOLS_TIMEOUT)
            .await?;
        self.governor.cache_put(cache_key, body.clone(), TICKERS_CACHE_TTL);
        parse_data::<Ticker>(&body)
    }

    /// `getSymbolsAndTickers` (§4.2): runs both operations concurrently,
    /// each independently through the Rate Governor. The joined pair is
    /// cached under its own key, distinct from the individual operation
    /// caches, so either can expire without invalidating the other.
    pub async fn get_symbols_and_tickers(&self) -> Result<(Vec<Contract>, Vec<Ticker>), ExchangeError> {
        if let Some(cached) = self.governor.cache_get(COMBINED_CACHE_KEY) {
            let symbols = parse_data_array::<Contract>(&json!({ "data": cached["symbols"] }))?;
            let tickers = parse_data_array::<Ticker>(&json!({ "data": cached["tickers"] }))?;
            return Ok((symbols, tickers));
        }

        let symbols_fut = self.get_symbols();
        let tickers_fut = self.get_all_tickers();
        let (symbols, tickers) = tokio::join!(
            tokio::time::timeout(COMBINED_TIMEOUT, symbols_fut),
            tokio::time::timeout(COMBINED_TIMEOUT, tickers_fut)
        );
        let symbols = symbols
            .map_err(|_| ExchangeError::Network("symbols request timed out".into()))??;
        let tickers = tickers
            .map_err(|_| ExchangeError::Network("tickers request timed out".into()))??;

        self.governor.cache_put(
            COMBINED_CACHE_KEY.to_string(),
            json!({ "symbols": symbols, "tickers": tickers }),
            COMBINED_CACHE_TTL,
        );
        Ok((symbols, tickers))
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let body = self
            .call_with_fallback("positions", RateCategory::Account, Priority::Medium, &[], true, SYMBOLS_TIMEOUT)
            .await?;
        parse_data_array::<Position>(&body)
    }

    pub async fn get_balance(&self) -> Result<Vec<Balance>, ExchangeError> {
        let body = self
            .call_with_fallback("balance", RateCategory::Account, Priority::Medium, &[], true, SYMBOLS_TIMEOUT)
            .await?;
        parse_data_array::<Balance>(&body)
    }

    pub async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.clone()),
            ("quantity", order.quantity.to_string()),
        ];
        if let Some(price) = order.price {
            params.push(("price", price.to_string()));
        }
        let body = self
            .call_with_fallback("order.place", RateCategory::Account, Priority::Critical, &params, true, SYMBOLS_TIMEOUT)
            .await?;
        parse_data::<OrderAck>(&body)
    }

    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderAck, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("orderId", order_id.to_string())];
        let body = self
            .call_with_fallback("order.cancel", RateCategory::Account, Priority::Critical, &params, true, SYMBOLS_TIMEOUT)
            .await?;
        parse_data::<OrderAck>(&body)
    }

    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>, ExchangeError> {
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self
            .call_with_fallback("klines", RateCategory::MarketData, Priority::Low, &params, false, SYMBOLS_TIMEOUT)
            .await?;
        parse_data_array::<Kline>(&body)
    }

    pub async fn get_depth(&self, symbol: &str, limit: u32) -> Result<Depth, ExchangeError> {
        let params = [("symbol", symbol.to_string()), ("limit", limit.to_string())];
        let body = self
            .call_with_fallback("depth", RateCategory::MarketData, Priority::Medium, &params, false, SYMBOLS_TIMEOUT)
            .await?;
        parse_data::<Depth>(&body)
    }

    /// Start a user-data-stream listen key (private, account category).
    pub async fn start_user_data_stream(&self) -> Result<String, ExchangeError> {
        let body = self
            .call_with_fallback("userDataStream", RateCategory::Account, Priority::Low, &[], true, SYMBOLS_TIMEOUT)
            .await?;
        let key = body
            .get("listenKey")
            .and_then(Value::as_str)
            .ok_or_else(|| ExchangeError::Unknown("missing listenKey in response".into()))?;
        Ok(key.to_string())
    }

    /// Keep a listen key alive; returns the classified error on failure.
    pub async fn keepalive_user_data_stream(&self, listen_key: &str) -> Result<(), ExchangeError> {
        let params = [("listenKey", listen_key.to_string())];
        self.call_with_fallback("userDataStream", RateCategory::Account, Priority::Low, &params, true, SYMBOLS_TIMEOUT)
            .await?;
        Ok(())
    }

    /// Walk the ranked candidate list for `operation`, applying the §7
    /// error-taxonomy retry policy around it: RATE_LIMIT surfaces
    /// immediately (no alternates, no retry - it drives Rate Governor
    /// recovery instead); AUTH and VALIDATION fail fast, never retried;
    /// NETWORK/SERVER/UNKNOWN are retried with exponential backoff and
    /// jitter across up to `max_attempts` rounds, each round walking the
    /// full candidate list before backing off.
    async fn call_with_fallback(
        &self,
        operation: &'static str,
        category: RateCategory,
        priority: Priority,
        params: &[(&str, String)],
        private: bool,
        timeout: Duration,
    ) -> Result<Value, ExchangeError> {
        if !self.governor.circuit_allows() {
            return Err(ExchangeError::Server("circuit breaker open".into()));
        }

        let max_attempts = match category {
            RateCategory::MarketData => MARKET_DATA_MAX_ATTEMPTS,
            RateCategory::Account => ACCOUNT_MAX_ATTEMPTS,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_candidates(operation, category, priority, params, private, timeout).await {
                Ok(body) => return Ok(body),
                Err(err) => {
                    if err.is_rate_limit() {
                        self.governor.trigger_rate_limit(&err);
                        return Err(err);
                    }
                    if matches!(err, ExchangeError::Auth(_) | ExchangeError::Validation(_)) {
                        return Err(err);
                    }
                    if !err.is_retryable() || attempt >= max_attempts {
                        return Err(err);
                    }
                    let backoff = backoff_with_jitter(attempt);
                    warn!(operation, attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "all candidates failed, backing off before retry");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// One pass over the ranked candidate list: stop at the first success
    /// or the first AUTH/VALIDATION/RATE_LIMIT failure, otherwise fall
    /// through to the next candidate after a short spacing delay (§4.2).
    async fn try_candidates(
        &self,
        operation: &'static str,
        category: RateCategory,
        priority: Priority,
        params: &[(&str, String)],
        private: bool,
        timeout: Duration,
    ) -> Result<Value, ExchangeError> {
        let candidates: Vec<String> = {
            let guard = self.endpoints.lock();
            let set = guard.get(operation).expect("operation registered at construction");
            set.ranked().into_iter().map(|m| m.path.clone()).collect()
        };

        let mut last_err = ExchangeError::Unknown(format!("no candidates registered for {operation}"));

        for (i, path) in candidates.iter().enumerate() {
            let permit = self.governor.acquire(category, priority).await?;

            let started = Instant::now();
            let result = self.execute(path, params, private, timeout).await;
            drop(permit);

            match result {
                Ok(body) => {
                    self.governor.record_success();
                    self.record_metric_success(operation, path, started.elapsed());
                    return Ok(body);
                }
                Err(err) => {
                    self.record_metric_failure(operation, path);
                    // RATE_LIMIT, AUTH, and VALIDATION fail fast (§7): no
                    // alternate candidate is worth trying for any of them.
                    if err.is_rate_limit() || matches!(err, ExchangeError::Auth(_) | ExchangeError::Validation(_)) {
                        return Err(err);
                    }
                    self.governor.record_failure();
                    warn!(operation, candidate = %path, error = %err, "candidate endpoint failed");
                    last_err = err;
                    if i + 1 < candidates.len() {
                        tokio::time::sleep(FALLBACK_SPACING).await;
                    }
                }
            }
        }

        Err(last_err)
    }

    async fn execute(&self, path: &str, params: &[(&str, String)], private: bool, timeout: Duration) -> Result<Value, ExchangeError> {
        let url = format!("{}{}", self.base_url(), path);
        let mut request = self.http.request(Method::GET, &url).timeout(timeout);

        if private {
            let api_key = self
                .config
                .api_key
                .as_deref()
                .ok_or_else(|| ExchangeError::Auth("missing BINGX_API_KEY for private endpoint".into()))?;
            let secret_key = self
                .config
                .secret_key
                .as_deref()
                .ok_or_else(|| ExchangeError::Auth("missing BINGX_SECRET_KEY for private endpoint".into()))?;

            let timestamp = chrono::Utc::now().timestamp_millis().to_string();
            let mut signed_params: Vec<(&str, String)> = params.to_vec();
            signed_params.push(("timestamp", timestamp));
            let query = canonical_query(&signed_params);
            let signature = sign(secret_key, &query);

            request = request
                .query(&signed_params)
                .query(&[("signature", signature)])
                .header("X-BX-APIKEY", api_key);
        } else {
            request = request.query(params);
        }

        let response = request.send().await.map_err(|e| ExchangeError::classify_transport(&e))?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();

        debug!(url, status, "exchange response received");

        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let upstream_code = parsed.get("code").and_then(Value::as_i64);

        if status != 200 || upstream_code.is_some_and(|c| c != 0) {
            return Err(ExchangeError::classify(status, upstream_code, &text));
        }

        Ok(parsed)
    }

    fn record_metric_success(&self, operation: &str, path: &str, elapsed: Duration) {
        if let Some(set) = self.endpoints.lock().get_mut(operation) {
            set.record_success(path, elapsed, Instant::now());
        }
    }

    fn record_metric_failure(&self, operation: &str, path: &str) {
        if let Some(set) = self.endpoints.lock().get_mut(operation) {
            set.record_failure(path);
        }
    }
}

/// Exponential backoff with jitter for the `attempt`-th retry (1-indexed):
/// `BACKOFF_BASE * 2^(attempt-1)` plus up to `BACKOFF_JITTER_MAX_MS` of
/// random jitter, so concurrent callers retrying after the same failure
/// don't all wake on the same tick (§7).
fn backoff_with_jitter(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MAX_MS));
    exp + jitter
}

fn parse_data_array<T: serde::de::DeserializeOwned>(body: &Value) -> Result<Vec<T>, ExchangeError> {
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| ExchangeError::Unknown(format!("bad response shape: {e}")))
}

fn parse_data<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T, ExchangeError> {
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    serde_json::from_value(data).map_err(|e| ExchangeError::Unknown(format!("bad response shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_with_attempt() {
        // Strip jitter from the comparison by checking the floor each
        // attempt must clear.
        let b1 = backoff_with_jitter(1);
        let b2 = backoff_with_jitter(2);
        let b3 = backoff_with_jitter(3);
        assert!(b1 >= BACKOFF_BASE && b1 < BACKOFF_BASE * 2);
        assert!(b2 >= BACKOFF_BASE * 2 && b2 < BACKOFF_BASE * 3);
        assert!(b3 >= BACKOFF_BASE * 4 && b3 < BACKOFF_BASE * 5);
    }

    #[test]
    fn backoff_jitter_stays_within_bound() {
        for attempt in 1..=5 {
            let backoff = backoff_with_jitter(attempt);
            let floor = BACKOFF_BASE * 2u32.pow(attempt - 1);
            let ceiling = floor + Duration::from_millis(BACKOFF_JITTER_MAX_MS);
            assert!(backoff >= floor && backoff <= ceiling, "attempt {attempt}: {backoff:?} outside [{floor:?}, {ceiling:?}]");
        }
    }

    #[test]
    fn market_data_and_account_attempt_caps_match_spec() {
        assert_eq!(MARKET_DATA_MAX_ATTEMPTS, 3);
        assert_eq!(ACCOUNT_MAX_ATTEMPTS, 5);
    }
}
