//! Token-bucket rate limiting for the client-facing tools.

use dashmap::DashMap;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token bucket limiter.
///
/// Each key (typically `tool` or `tool:provider`) gets its own bucket of
/// `burst` tokens refilled at `rps` tokens per second.
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(rps: f64, burst: u32) -> Self {
        Self {
            rps: rps.max(0.001),
            burst: burst.max(1) as f64,
            buckets: DashMap::new(),
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rps).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let limiter = RateLimiter::new(1.0, 3);
        assert!(limiter.check("list"));
        assert!(limiter.check("list"));
        assert!(limiter.check("list"));
        assert!(!limiter.check("list"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new(1000.0, 1);
        assert!(limiter.check("x"));
        assert!(!limiter.check("x"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(limiter.check("x"));
    }
}
