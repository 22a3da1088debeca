//! Outgoing packet rate limiting.
//!
//! A token bucket refilled at the configured packets-per-second rate with a
//! two-second burst allowance. Queries that find the bucket empty are
//! deferred by the event loop in FIFO order; replies to inbound queries may
//! overdraw a little, since remote peers demote nodes that answer slowly.

use std::time::{Duration, Instant};

/// How far below zero a reply may push the bucket.
const REPLY_OVERDRAFT: f64 = 8.0;

#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    per_sec: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// A limiter refilling at `packets_per_sec`; zero means unlimited.
    pub fn new(packets_per_sec: u32, now: Instant) -> Self {
        let per_sec = if packets_per_sec == 0 {
            f64::INFINITY
        } else {
            packets_per_sec as f64
        };
        let max_tokens = if per_sec.is_infinite() {
            f64::INFINITY
        } else {
            per_sec * 2.0
        };
        Self {
            tokens: max_tokens,
            max_tokens,
            per_sec,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.per_sec.is_infinite() {
            return;
        }
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.max_tokens);
    }

    /// Takes one token for an outgoing query; false means defer.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Takes one token for a reply, allowing a bounded overdraft. Past the
    /// overdraft even replies are dropped; that is the global ceiling.
    pub fn try_acquire_reply(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 - REPLY_OVERDRAFT {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token accrues, as of the last refill; used to pace
    /// the deferred queue.
    pub fn next_available(&self) -> Duration {
        if self.per_sec.is_infinite() || self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(10, now);

        // 2x burst allowance.
        for _ in 0..20 {
            assert!(limiter.try_acquire(now));
        }
        assert!(!limiter.try_acquire(now));
    }

    #[test]
    fn test_refill_over_time() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(10, now);
        while limiter.try_acquire(now) {}

        let later = now + Duration::from_millis(500);
        let mut granted = 0;
        while limiter.try_acquire(later) {
            granted += 1;
        }
        assert_eq!(granted, 5, "10 pkts/sec refills 5 tokens in 500ms");
    }

    #[test]
    fn test_replies_overdraw_but_not_forever() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(10, now);
        while limiter.try_acquire(now) {}

        let mut granted = 0;
        while limiter.try_acquire_reply(now) {
            granted += 1;
        }
        assert!(granted > 0, "replies bypass the empty bucket");
        assert!(granted <= 8, "but respect the global ceiling");
    }

    #[test]
    fn test_unlimited() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(0, now);
        for _ in 0..10_000 {
            assert!(limiter.try_acquire(now));
        }
        assert_eq!(limiter.next_available(), Duration::ZERO);
    }
}
