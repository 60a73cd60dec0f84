//! Rate Governor (§4.1): two categorized token buckets, a circuit breaker,
//! and a response cache, all process-wide and mutex-protected (§5).

mod bucket;
mod cache;
mod circuit_breaker;

pub use bucket::{Priority, TokenBucket};
pub use cache::{CacheStats, ResponseCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateCategory {
    MarketData,
    Account,
}

impl RateCategory {
    fn index(self) -> usize {
        match self {
            RateCategory::MarketData => 0,
            RateCategory::Account => 1,
        }
    }
}

struct CategoryState {
    bucket: TokenBucket,
    waiters: [VecDeque<oneshot::Sender<Permit>>; 4],
}

impl CategoryState {
    fn new(bucket: TokenBucket) -> Self {
        Self {
            bucket,
            waiters: Default::default(),
        }
    }

    /// Hand already-admitted permits to queued waiters, highest priority
    /// first, until the bucket can no longer admit (out of tokens, at max
    /// concurrency, or inside the min-spacing window). The token and
    /// `in_flight` slot `try_acquire` consumes here are the waiter's -
    /// the woken waiter must not acquire again, or they'd be double-spent.
    fn drain(&mut self, now: Instant, governor: &Arc<RateGovernor>, category: RateCategory) {
        for p in Priority::ALL {
            while let Some(front) = self.waiters[p.index()].front() {
                if front.is_closed() {
                    self.waiters[p.index()].pop_front();
                    continue;
                }
                if !self.bucket.try_acquire(now) {
                    return;
                }
                let tx = self.waiters[p.index()].pop_front().unwrap();
                let permit = Permit {
                    governor: governor.clone(),
                    category,
                };
                if let Err(permit) = tx.send(permit) {
                    // The waiter dropped its receiver between the
                    // `is_closed` check and this send. Release what we
                    // just acquired by hand rather than dropping `permit`:
                    // its Drop impl would re-lock this same category mutex,
                    // which we're still holding.
                    std::mem::forget(permit);
                    self.bucket.release();
                }
            }
        }
    }
}

/// Process-wide admission control, circuit breaking, and response caching
/// for calls to the upstream exchange. One instance per process; tests
/// construct their own instead of sharing a global (§9).
pub struct RateGovernor {
    categories: [Mutex<CategoryState>; 2],
    circuit: Mutex<CircuitBreaker>,
    cache: Mutex<ResponseCache<Value>>,
    rate_limited: AtomicBool,
    recovery_deadline: Mutex<Option<Instant>>,
    dev_mode: bool,
}

impl RateGovernor {
    pub fn new(dev_mode: bool) -> Arc<Self> {
        let governor = Arc::new(Self {
            categories: [
                Mutex::new(CategoryState::new(TokenBucket::market_data())),
                Mutex::new(CategoryState::new(TokenBucket::account())),
            ],
            circuit: Mutex::new(CircuitBreaker::new(CircuitBreakerConfig::default())),
            cache: Mutex::new(ResponseCache::new()),
            rate_limited: AtomicBool::new(false),
            recovery_deadline: Mutex::new(None),
            dev_mode,
        });
        governor.clone().spawn_refill_tasks();
        governor
    }

    fn spawn_refill_tasks(self: Arc<Self>) {
        for category in [RateCategory::MarketData, RateCategory::Account] {
            let governor = self.clone();
            let interval = {
                let guard = governor.categories[category.index()].lock();
                guard.bucket.refill_interval
            };
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    governor.refill_and_drain(category);
                }
            });
        }
    }

    fn refill_and_drain(self: &Arc<Self>, category: RateCategory) {
        let now = Instant::now();
        let mut guard = self.categories[category.index()].lock();
        guard.bucket.refill();
        guard.drain(now, self, category);
    }

    /// Admission control entry point. Suspends the caller until a token is
    /// available, unless the global rate-limited flag is set, in which
    /// case it fails fast with the remaining recovery time (§4.1).
    pub async fn acquire(
        self: &Arc<Self>,
        category: RateCategory,
        priority: Priority,
    ) -> Result<Permit, ExchangeError> {
        if let Some(err) = self.rate_limit_error() {
            return Err(err);
        }

        let outcome = {
            let mut guard = self.categories[category.index()].lock();
            if guard.bucket.try_acquire(Instant::now()) {
                Ok(Permit {
                    governor: self.clone(),
                    category,
                })
            } else {
                let (tx, rx) = oneshot::channel();
                guard.waiters[priority.index()].push_back(tx);
                Err(rx)
            }
        };

        match outcome {
            Ok(permit) => Ok(permit),
            Err(rx) => {
                // A refill or release drain hands us an already-admitted
                // permit directly; there is no second acquire to make here.
                rx.await
                    .map_err(|_| ExchangeError::Unknown("rate governor dropped without admitting a queued waiter".to_string()))
            }
        }
    }

    fn rate_limit_error(&self) -> Option<ExchangeError> {
        if !self.rate_limited.load(Ordering::SeqCst) {
            return None;
        }
        let deadline = *self.recovery_deadline.lock();
        match deadline {
            Some(d) if d > Instant::now() => Some(ExchangeError::RateLimit {
                recovery: d - Instant::now(),
            }),
            _ => {
                self.clear_rate_limit();
                None
            }
        }
    }

    /// Drive the recovery sequence described in §4.1 after a RATE_LIMIT
    /// classification: suspend both buckets, schedule the clearing.
    pub fn trigger_rate_limit(self: &Arc<Self>, err: &ExchangeError) {
        let ExchangeError::RateLimit { recovery } = err else {
            return;
        };
        let recovery = if self.dev_mode {
            Duration::from_secs_f64(recovery.as_secs_f64() * 1.2)
        } else {
            *recovery
        };
        let recovery = recovery.max(Duration::from_secs(10));

        warn!(recovery_secs = recovery.as_secs(), "rate limit triggered, suspending admission");
        self.rate_limited.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + recovery;
        *self.recovery_deadline.lock() = Some(deadline);

        let governor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(recovery).await;
            governor.clear_rate_limit();
        });
    }

    fn clear_rate_limit(&self) {
        debug!("rate limit recovery deadline reached, resuming admission");
        self.rate_limited.store(false, Ordering::SeqCst);
        *self.recovery_deadline.lock() = None;
        for category in &self.categories {
            category.lock().bucket.refill();
        }
        self.circuit.lock().reset();
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limited.load(Ordering::SeqCst)
    }

    pub fn circuit_allows(&self) -> bool {
        self.circuit.lock().allow(Instant::now())
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.lock().state()
    }

    pub fn record_success(&self) {
        self.circuit.lock().on_success();
    }

    pub fn record_failure(&self) {
        self.circuit.lock().on_failure(Instant::now());
    }

    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.lock().get(key, Instant::now())
    }

    pub fn cache_put(&self, key: String, value: Value, ttl: Duration) {
        self.cache.lock().put(key, value, ttl, Instant::now());
    }

    pub fn cache_invalidate(&self, pattern: &str) -> usize {
        self.cache.lock().invalidate(pattern)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }
}

/// RAII admission permit. Releasing it frees a concurrency slot and may
/// wake the next queued waiter.
pub struct Permit {
    governor: Arc<RateGovernor>,
    category: RateCategory,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let now = Instant::now();
        let mut guard = self.governor.categories[self.category.index()].lock();
        guard.bucket.release();
        guard.drain(now, &self.governor, self.category);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_succeeds_under_capacity() {
        let governor = RateGovernor::new(false);
        let permit = governor.acquire(RateCategory::Account, Priority::Medium).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn rate_limited_flag_fails_fast_with_recovery_seconds() {
        let governor = RateGovernor::new(false);
        governor.trigger_rate_limit(&ExchangeError::RateLimit {
            recovery: Duration::from_secs(30),
        });
        let err = governor.acquire(RateCategory::MarketData, Priority::High).await;
        match err {
            Err(ExchangeError::RateLimit { recovery }) => assert!(recovery.as_secs() <= 30 && recovery.as_secs() > 0),
            other => panic!("expected RateLimit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn releasing_a_permit_wakes_a_waiter() {
        // Two tokens but one concurrency slot: the second acquire is
        // blocked on `max_concurrent`, not on token exhaustion, so
        // dropping the first permit (which only frees `in_flight`) is
        // enough to admit it without waiting on a refill.
        let governor = RateGovernor::new(false);
        {
            let mut guard = governor.categories[RateCategory::Account.index()].lock();
            guard.bucket = TokenBucket::new(2, Duration::from_secs(3600), Duration::ZERO, 1);
        }
        let first = governor.acquire(RateCategory::Account, Priority::Medium).await.unwrap();
        let governor2 = governor.clone();
        let waiter = tokio::spawn(async move {
            governor2.acquire(RateCategory::Account, Priority::Medium).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn queued_waiters_drain_on_refill_without_exceeding_capacity() {
        // Capacity 2 with a high max_concurrent isolates the token-quota
        // path: admission is gated purely by `available`, refilled on a
        // window boundary, never by concurrency.
        let governor = RateGovernor::new(false);
        {
            let mut guard = governor.categories[RateCategory::MarketData.index()].lock();
            guard.bucket = TokenBucket::new(2, Duration::from_secs(3600), Duration::ZERO, 10);
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let governor = governor.clone();
            handles.push(tokio::spawn(async move {
                governor.acquire(RateCategory::MarketData, Priority::Medium).await
            }));
        }
        // Let the first two acquires land synchronously and the rest queue.
        tokio::time::sleep(Duration::from_millis(20)).await;

        {
            let guard = governor.categories[RateCategory::MarketData.index()].lock();
            assert_eq!(guard.bucket.available(), 0, "the first 2 acquires exhaust the window");
            assert_eq!(guard.bucket.in_flight(), 2);
        }

        // Simulate the periodic tick the background refill task would
        // otherwise fire after `refill_interval`.
        governor.refill_and_drain(RateCategory::MarketData);

        let mut permits = Vec::new();
        for h in handles {
            permits.push(h.await.unwrap().unwrap());
        }
        assert_eq!(
            permits.len(),
            4,
            "every queued waiter is admitted exactly once, none lost to a double-acquire"
        );

        {
            let guard = governor.categories[RateCategory::MarketData.index()].lock();
            assert_eq!(guard.bucket.in_flight(), 4, "4 outstanding permits, never orphaned above max_concurrent");
        }

        drop(permits);
        let guard = governor.categories[RateCategory::MarketData.index()].lock();
        assert_eq!(guard.bucket.in_flight(), 0, "dropping every permit frees all in-flight slots back to zero");
    }
}
