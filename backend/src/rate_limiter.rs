use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

/// Buckets untouched for this long are discarded and start full again.
pub const BUCKET_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct LimiterState {
    max_tokens: f64,
    bucket: Option<RateBucket>,
}

impl LimiterState {
    fn refill_rate(&self) -> f64 {
        self.max_tokens / 60.0
    }

    /// Bucket as it would look at `now`, without storing it.
    fn refilled(&self, now: Instant) -> RateBucket {
        match self.bucket {
            Some(bucket) if now.saturating_duration_since(bucket.last_refill) <= BUCKET_TTL => {
                let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
                RateBucket {
                    tokens: (bucket.tokens + elapsed * self.refill_rate()).min(self.max_tokens),
                    last_refill: now,
                }
            }
            _ => RateBucket {
                tokens: self.max_tokens,
                last_refill: now,
            },
        }
    }
}

/// Token bucket shared by every clone. Refills lazily at `max_tokens / 60`
/// tokens per second.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    /// `requests_per_minute` below 1 is treated as 1.
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LimiterState {
                max_tokens: f64::from(requests_per_minute.max(1)),
                bucket: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spends one token if available.
    pub fn consume(&self) -> bool {
        let mut state = self.lock();
        let mut bucket = state.refilled(Instant::now());
        let admitted = bucket.tokens >= 1.0;
        if admitted {
            bucket.tokens -= 1.0;
        }
        state.bucket = Some(bucket);
        admitted
    }

    /// Time until the next `consume` is expected to succeed, rounded up to
    /// whole seconds.
    pub fn wait_time(&self) -> Duration {
        let state = self.lock();
        let bucket = state.refilled(Instant::now());
        if bucket.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let seconds = ((1.0 - bucket.tokens) / state.refill_rate()).ceil();
        Duration::from_secs(seconds as u64)
    }

    pub fn reset(&self) {
        self.lock().bucket = None;
    }

    pub fn token_count(&self) -> f64 {
        self.lock().refilled(Instant::now()).tokens
    }

    pub fn max_tokens(&self) -> u32 {
        self.lock().max_tokens as u32
    }

    /// Applies a new per-minute limit. The current bucket is discarded.
    pub fn set_rate(&self, requests_per_minute: u32) {
        let mut state = self.lock();
        state.max_tokens = f64::from(requests_per_minute.max(1));
        state.bucket = None;
    }

    /// Waits until a token is admitted. Returns how long the caller slept.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            if self.consume() {
                return started.elapsed();
            }
            let wait = self.wait_time();
            if wait.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
