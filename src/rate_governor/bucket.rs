//! The pure token-bucket arithmetic behind each category (§3 RateBucket,
//! §4.1). Kept free of async/IO so the hard-reset-per-window invariant is
//! directly unit-testable.

use std::time::{Duration, Instant};

/// Waiter priority; lower numeric value preempts higher (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        self as u8 as usize
    }
}

/// Fixed-window token bucket with hard-reset semantics: `refill` resets
/// `available` to `capacity` rather than adding a delta, matching the
/// upstream's fixed-window quota (§4.1).
#[derive(Debug, Clone)]
pub struct TokenBucket {
    pub capacity: u32,
    pub refill_interval: Duration,
    pub min_time: Duration,
    pub max_concurrent: u32,
    available: u32,
    in_flight: u32,
    last_dequeue: Option<Instant>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_interval: Duration, min_time: Duration, max_concurrent: u32) -> Self {
        Self {
            capacity,
            refill_interval,
            min_time,
            max_concurrent,
            available: capacity,
            in_flight: 0,
            last_dequeue: None,
        }
    }

    /// Market-data bucket defaults (§4.1): capacity 95 / 10s, 105ms
    /// spacing, at most 2 in flight.
    pub fn market_data() -> Self {
        Self::new(95, Duration::from_secs(10), Duration::from_millis(105), 2)
    }

    /// Account/trading bucket defaults (§4.1): capacity 950 / 10s, 12ms
    /// spacing, at most 3 in flight.
    pub fn account() -> Self {
        Self::new(950, Duration::from_secs(10), Duration::from_millis(12), 3)
    }

    /// Attempt immediate admission. Returns `true` and consumes a token if
    /// the bucket has capacity, spacing, and concurrency headroom.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.available == 0 || self.in_flight >= self.max_concurrent {
            return false;
        }
        if let Some(last) = self.last_dequeue {
            if now.duration_since(last) < self.min_time {
                return false;
            }
        }
        self.available -= 1;
        self.in_flight += 1;
        self.last_dequeue = Some(now);
        true
    }

    /// Hard-reset the window: `available` becomes `capacity`, never
    /// `available + refill_amount`.
    pub fn refill(&mut self) {
        self.available = self.capacity;
    }

    /// Called when an admitted call completes, freeing a concurrency slot.
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }
}
