//! Token-bucket rate limiter shared by every job calling the service.

use std::sync::Mutex;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

/// Lowest accepted non-zero rate: one call per hour.
const MIN_RATE_PER_SEC: f64 = 1.0 / 3600.0;

/// Longest single wait for a token.
const MAX_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Admits at most `rate_per_sec` calls per second on average, with bursts
/// of up to `burst` calls.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_sec: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Creates a limiter. A rate of zero, a negative or non-finite rate
    /// disables limiting; tiny positive rates are raised to one call per hour.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        let rate_per_sec = if rate_per_sec.is_finite() && rate_per_sec > 0.0 {
            rate_per_sec.max(MIN_RATE_PER_SEC)
        } else {
            0.0
        };
        Self {
            rate_per_sec,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(0.0, 1)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec == 0.0
    }

    /// Waits until a call may be made and consumes one token.
    pub async fn acquire(&self) {
        if self.is_unlimited() {
            return;
        }

        loop {
            let wait = match self.try_take() {
                None => return,
                Some(wait) => wait,
            };
            debug!("Rate limit reached; waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Takes a token if one is available, otherwise returns how long until
    /// one will be.
    fn try_take(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            let missing = 1.0 - bucket.tokens;
            let wait = Duration::try_from_secs_f64(missing / self.rate_per_sec).unwrap_or(MAX_WAIT);
            Some(wait.min(MAX_WAIT))
        }
    }

    /// Tokens currently available, after refilling.
    pub fn available(&self) -> f64 {
        if self.is_unlimited() {
            return f64::INFINITY;
        }
        let mut bucket = self.bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        bucket.tokens
    }
}
