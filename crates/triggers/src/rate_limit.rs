//! Token-bucket rate limiter for the webhook endpoint.

use parking_lot::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: `rate` tokens/second refill up to `burst`.
pub struct TokenBucketRateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketRateLimiter {
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Derive limits from a requests-per-minute figure: `rpm/60` per second
    /// with roughly a ten-second burst, never less than 1.
    pub fn from_rpm(rpm: u32) -> Self {
        Self::new(f64::from(rpm) / 60.0, (rpm / 6).max(1))
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
