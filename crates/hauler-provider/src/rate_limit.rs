//! Process-global token bucket for provider calls.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::error;

struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

/// Token bucket limiter: refill rate `rate` tokens/sec, capacity
/// `burst`.
///
/// The required wait is computed under the lock, then the lock is
/// released before sleeping and the acquisition retried, so a stalled
/// waiter can never block other callers from refilling.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<Bucket>,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("tokens", &self.tokens).finish()
    }
}

impl RateLimiter {
    /// Construct a limiter that starts with a full bucket.
    ///
    /// # Panics
    ///
    /// Panics if `rate_per_sec` is not positive or `burst` is zero.
    #[must_use]
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        assert!(rate_per_sec > 0.0, "rate must be positive");
        assert!(burst > 0, "burst must be at least 1");
        Self {
            rate: rate_per_sec,
            burst: f64::from(burst),
            state: Mutex::new(Bucket {
                tokens: f64::from(burst),
                refreshed: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping as long as necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = match self.state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => {
                        error!("rate limiter mutex poisoned; continuing with recovered guard");
                        poisoned.into_inner()
                    }
                };
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refreshed).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.refreshed = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate)
            };
            // lock is released here; sleep, then re-check
            tokio::time::sleep(wait).await;
        }
    }
}
