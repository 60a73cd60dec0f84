//! Proven-endpoint ranking for each logical operation (§3 EndpointMetric,
//! §4.2).

use std::time::{Duration, Instant};

/// Per-URL metric state, updated after every call.
#[derive(Debug, Clone)]
pub struct EndpointMetric {
    pub path: String,
    pub success_rate: f64,
    pub last_success_time: Option<Instant>,
    pub avg_response_time: Duration,
    pub total_calls: u64,
    pub failures: u64,
}

impl EndpointMetric {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            success_rate: 100.0,
            last_success_time: None,
            avg_response_time: Duration::ZERO,
            total_calls: 0,
            failures: 0,
        }
    }

    pub fn record_success(&mut self, measured: Duration, now: Instant) {
        self.total_calls += 1;
        self.success_rate = ((self.success_rate * (self.total_calls - 1) as f64) + 100.0) / self.total_calls as f64;
        self.last_success_time = Some(now);
        self.avg_response_time = (self.avg_response_time + measured) / 2;
    }

    pub fn record_failure(&mut self) {
        self.total_calls += 1;
        self.failures += 1;
        self.success_rate = (self.success_rate * (self.total_calls - 1) as f64) / self.total_calls as f64;
    }
}

/// An ordered list of candidate endpoint paths for one logical operation
/// (the "proven endpoints", §4.2), each tracked with its own metric.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    metrics: Vec<EndpointMetric>,
}

impl EndpointSet {
    pub fn new(paths: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            metrics: paths.into_iter().map(EndpointMetric::new).collect(),
        }
    }

    /// Candidates ordered by success rate, tie-broken by most recent
    /// `last_success_time` (§4.2).
    pub fn ranked(&self) -> Vec<&EndpointMetric> {
        let mut v: Vec<&EndpointMetric> = self.metrics.iter().collect();
        v.sort_by(|a, b| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.last_success_time.cmp(&a.last_success_time))
        });
        v
    }

    pub fn record_success(&mut self, path: &str, measured: Duration, now: Instant) {
        if let Some(m) = self.metrics.iter_mut().find(|m| m.path == path) {
            m.record_success(measured, now);
        }
    }

    pub fn record_failure(&mut self, path: &str) {
        if let Some(m) = self.metrics.iter_mut().find(|m| m.path == path) {
            m.record_failure();
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_increases_rate_toward_100() {
        let mut m = EndpointMetric::new("/a");
        m.success_rate = 50.0;
        m.total_calls = 1;
        m.record_success(Duration::from_millis(10), Instant::now());
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.success_rate, 75.0);
    }

    #[test]
    fn failure_decreases_rate() {
        let mut m = EndpointMetric::new("/a");
        m.success_rate = 100.0;
        m.total_calls = 1;
        m.record_failure();
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.success_rate, 50.0);
        assert_eq!(m.failures, 1);
    }

    #[test]
    fn ranking_prefers_higher_success_rate() {
        let mut set = EndpointSet::new(["/a", "/b"]);
        set.record_failure("/a");
        let now = Instant::now();
        set.record_success("/b", Duration::from_millis(5), now);
        let ranked = set.ranked();
        assert_eq!(ranked[0].path, "/b");
    }

    #[test]
    fn ranking_tie_breaks_by_recency() {
        let mut set = EndpointSet::new(["/a", "/b"]);
        let t0 = Instant::now();
        set.record_success("/a", Duration::from_millis(1), t0);
        set.record_success("/b", Duration::from_millis(1), t0 + Duration::from_secs(1));
        let ranked = set.ranked();
        assert_eq!(ranked[0].path, "/b", "more recent success should rank first on a tie");
    }
}
