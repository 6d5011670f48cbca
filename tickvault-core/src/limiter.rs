//! Shared token-bucket rate limiter for upstream API calls.
//!
//! One limiter instance gates every concurrent fetch pipeline: the cap is
//! global across the whole fetch call, not per pipeline. `acquire` suspends
//! the calling task until a token is free, so a saturated bucket slows all
//! pipelines down together instead of failing any of them.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    /// Refill rate in tokens per second.
    rate: f64,
    capacity: f64,
}

impl TokenBucket {
    fn new(max_calls: u32, per: Duration) -> Self {
        let capacity = f64::from(max_calls).max(1.0);
        Self {
            tokens: capacity,
            last_update: Instant::now(),
            rate: capacity / per.as_secs_f64().max(f64::EPSILON),
            capacity,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.rate)
        }
    }
}

/// Token-bucket limiter admitting at most `max_calls` per `per` period,
/// shared by all pipelines of a fetch run.
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(max_calls: u32, per: Duration) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(max_calls, per)),
        }
    }

    /// Recover from poison rather than panicking: the worst case is slightly
    /// inaccurate rate limiting.
    fn lock_bucket(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Wait (asynchronously) until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.lock_bucket();
                if bucket.try_acquire() {
                    return;
                }
                bucket.time_until_available()
            };
            if wait > Duration::ZERO {
                debug!(wait_ms = wait.as_millis() as u64, "rate limiter saturated, waiting");
                tokio::time::sleep(wait).await;
            }
        }
    }

    /// Consume a token if one is available without waiting.
    pub fn try_acquire(&self) -> bool {
        self.lock_bucket().try_acquire()
    }
}

impl Default for RateLimiter {
    /// 100 calls per 30 seconds, a conservative fit for public market-data
    /// endpoints.
    fn default() -> Self {
        Self::new(100, Duration::from_secs(30))
    }
}
