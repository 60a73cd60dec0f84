//! Keyed response cache with per-call TTL and bulk-LRU-approximation
//! eviction (§4.1).

use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 1000;
const EVICT_FRACTION: f64 = 0.30;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Instant,
    hits: u64,
}

/// A process-wide, mutex-protected cache. Process-wide state is owned by
/// the caller (`RateGovernor`); this type holds no global/static state
/// itself (§9 design note on explicit init/teardown).
pub struct ResponseCache<V> {
    entries: HashMap<String, Entry<V>>,
    evictions: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub evictions: u64,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            evictions: 0,
        }
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        let expired = self.entries.get(key).is_some_and(|e| now >= e.expires_at);
        if expired {
            self.entries.remove(key);
            return None;
        }
        if let Some(e) = self.entries.get_mut(key) {
            e.hits += 1;
            Some(e.value.clone())
        } else {
            None
        }
    }

    pub fn put(&mut self, key: String, value: V, ttl: Duration, now: Instant) {
        if self.entries.len() >= MAX_ENTRIES {
            self.evict_oldest(now);
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                expires_at: now + ttl,
                hits: 0,
            },
        );
    }

    /// Remove all entries whose key contains `pattern` (§B of SPEC_FULL.md:
    /// substring match, matching the loose "pattern" semantics used by the
    /// original cache layer). Returns the number of keys removed.
    pub fn invalidate(&mut self, pattern: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.contains(pattern));
        before - self.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.entries.values().map(|e| e.hits).sum(),
            evictions: self.evictions,
        }
    }

    /// Drop the oldest 30% by insertion timestamp (§4.1 bulk LRU
    /// approximation - not a true LRU, since only insertion time is
    /// tracked, matching the upstream's cheap eviction policy).
    fn evict_oldest(&mut self, _now: Instant) {
        let to_evict = ((self.entries.len() as f64) * EVICT_FRACTION).ceil() as usize;
        if to_evict == 0 {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);
        for (key, _) in by_age.into_iter().take(to_evict) {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}

impl<V: Clone> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_increments_counter_and_skips_recompute() {
        let mut c: ResponseCache<i32> = ResponseCache::new();
        let now = Instant::now();
        c.put("k".into(), 42, Duration::from_secs(10), now);
        assert_eq!(c.get("k", now), Some(42));
        assert_eq!(c.get("k", now), Some(42));
        assert_eq!(c.stats().hits, 2);
    }

    #[test]
    fn expired_entry_is_absent() {
        let mut c: ResponseCache<i32> = ResponseCache::new();
        let now = Instant::now();
        c.put("k".into(), 1, Duration::from_millis(10), now);
        let later = now + Duration::from_millis(20);
        assert_eq!(c.get("k", later), None);
    }

    #[test]
    fn evicts_oldest_thirty_percent_past_capacity() {
        let mut c: ResponseCache<i32> = ResponseCache::new();
        let base = Instant::now();
        for i in 0..1000 {
            c.put(format!("k{i}"), i, Duration::from_secs(3600), base + Duration::from_millis(i as u64));
        }
        assert_eq!(c.stats().entries, 1000);
        c.put("k_overflow".into(), -1, Duration::from_secs(3600), base + Duration::from_secs(10));
        let stats = c.stats();
        assert!(stats.evictions >= 299, "expected ~30% eviction, got {}", stats.evictions);
        assert!(stats.entries < 1000);
    }

    #[test]
    fn invalidate_removes_matching_substring() {
        let mut c: ResponseCache<i32> = ResponseCache::new();
        let now = Instant::now();
        c.put("symbols:all".into(), 1, Duration::from_secs(10), now);
        c.put("tickers:all".into(), 2, Duration::from_secs(10), now);
        c.put("tickers:BTC-USDT".into(), 3, Duration::from_secs(10), now);
        let removed = c.invalidate("tickers");
        assert_eq!(removed, 2);
        assert_eq!(c.stats().entries, 1);
    }
}
