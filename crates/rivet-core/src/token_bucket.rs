//! Token bucket rate limiter
//!
//! Standalone utility with no reactor dependency. A rate-limited writer
//! task calls `try_acquire` before each burst and, when refused, races a
//! TIMER operation for `delay_for(n)` against whatever else it is doing.
//!
//! Refill is computed lazily from a monotonic clock: no timer thread, no
//! background work. Fractional accumulation uses nanosecond arithmetic so
//! slow rates (a few tokens per second) do not round to zero.

use std::time::{Duration, Instant};

/// A token bucket: `capacity` burst size, `rate` tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    /// Tokens per second
    rate: u64,
    /// Tokens currently available, in nano-tokens (token * 1e9)
    available_nanos: u128,
    last_refill: Instant,
}

const NANOS_PER_TOKEN: u128 = 1_000_000_000;

impl TokenBucket {
    /// Create a bucket holding at most `capacity` tokens, refilled at
    /// `rate` tokens per second. The bucket starts full.
    pub fn new(capacity: u64, rate: u64) -> Self {
        assert!(capacity > 0, "zero-capacity bucket");
        assert!(rate > 0, "zero-rate bucket");
        Self {
            capacity,
            rate,
            available_nanos: capacity as u128 * NANOS_PER_TOKEN,
            last_refill: Instant::now(),
        }
    }

    /// Tokens currently available (whole tokens).
    pub fn available(&mut self) -> u64 {
        self.refill(Instant::now());
        (self.available_nanos / NANOS_PER_TOKEN) as u64
    }

    /// Take `n` tokens if available. Returns false (taking nothing) otherwise.
    pub fn try_acquire(&mut self, n: u64) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    /// How long until `n` tokens will be available.
    ///
    /// Returns `Duration::ZERO` when they already are. `n` above capacity
    /// can never be satisfied; that is a caller bug.
    pub fn delay_for(&mut self, n: u64) -> Duration {
        self.delay_for_at(n, Instant::now())
    }

    // Clock-explicit variants, used directly by tests.

    pub(crate) fn try_acquire_at(&mut self, n: u64, now: Instant) -> bool {
        self.refill(now);
        let need = n as u128 * NANOS_PER_TOKEN;
        if self.available_nanos >= need {
            self.available_nanos -= need;
            true
        } else {
            false
        }
    }

    pub(crate) fn delay_for_at(&mut self, n: u64, now: Instant) -> Duration {
        assert!(n <= self.capacity, "request exceeds bucket capacity");
        self.refill(now);
        let need = n as u128 * NANOS_PER_TOKEN;
        if self.available_nanos >= need {
            return Duration::ZERO;
        }
        let missing = need - self.available_nanos;
        // missing nano-tokens / (rate tokens per second) = nanoseconds
        let nanos = missing.div_ceil(self.rate as u128);
        Duration::from_nanos(nanos as u64)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let earned = elapsed.as_nanos() * self.rate as u128;
        let cap = self.capacity as u128 * NANOS_PER_TOKEN;
        self.available_nanos = (self.available_nanos + earned).min(cap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_full() {
        let mut tb = TokenBucket::new(10, 100);
        assert!(tb.try_acquire(10));
        assert!(!tb.try_acquire(1));
    }

    #[test]
    fn test_refill_over_time() {
        let mut tb = TokenBucket::new(10, 1000); // 1 token per ms
        let t0 = Instant::now();
        assert!(tb.try_acquire_at(10, t0));
        assert!(!tb.try_acquire_at(1, t0));

        // 5ms later: 5 tokens earned
        let t1 = t0 + Duration::from_millis(5);
        assert!(tb.try_acquire_at(5, t1));
        assert!(!tb.try_acquire_at(1, t1));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut tb = TokenBucket::new(4, 1000);
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(60);
        tb.try_acquire_at(0, later); // force refill
        assert!(tb.try_acquire_at(4, later));
        assert!(!tb.try_acquire_at(1, later));
    }

    #[test]
    fn test_delay_for() {
        let mut tb = TokenBucket::new(10, 1000); // 1 token per ms
        let t0 = Instant::now();
        assert!(tb.try_acquire_at(10, t0));

        let d = tb.delay_for_at(3, t0);
        assert_eq!(d, Duration::from_millis(3));

        // already satisfied => zero
        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(tb.delay_for_at(3, t1), Duration::ZERO);
    }

    #[test]
    fn test_slow_rate_accumulates_fractions() {
        let mut tb = TokenBucket::new(2, 2); // 2 tokens per second
        let t0 = Instant::now();
        assert!(tb.try_acquire_at(2, t0));

        // 0.5s earns exactly one token
        let t1 = t0 + Duration::from_millis(500);
        assert!(tb.try_acquire_at(1, t1));
        assert!(!tb.try_acquire_at(1, t1));
    }

    #[test]
    #[should_panic(expected = "exceeds bucket capacity")]
    fn test_delay_beyond_capacity_panics() {
        let mut tb = TokenBucket::new(2, 10);
        let _ = tb.delay_for(3);
    }
}
