use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Token bucket refilled continuously over `window`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket holding `capacity` tokens that refills completely over `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(f64::EPSILON),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn unlimited(&self) -> bool {
        self.capacity <= 0.0
    }

    /// Time until one whole token is available (zero if one is ready).
    fn wait_for_token(&self) -> Duration {
        if self.unlimited() || self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let needed = 1.0 - self.tokens;
        Duration::from_secs_f64(needed / self.refill_per_sec)
    }

    /// Tokens currently available after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

/// Independent per-minute and per-hour budgets consumed together.
///
/// A request takes one token from both buckets under a single lock, so
/// concurrent callers can never over-consume either budget.
pub struct DualRateLimiter {
    buckets: Mutex<(TokenBucket, TokenBucket)>,
}

impl DualRateLimiter {
    /// A zero budget disables that bucket.
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            buckets: Mutex::new((
                TokenBucket::new(per_minute, Duration::from_secs(60)),
                TokenBucket::new(per_hour, Duration::from_secs(3600)),
            )),
        }
    }

    /// Wait until both budgets have a token, consume them and return how long
    /// the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            let wait = {
                let mut guard = self.buckets.lock().await;
                let (minute, hour) = &mut *guard;
                let now = Instant::now();
                minute.refill(now);
                hour.refill(now);
                let wait = minute.wait_for_token().max(hour.wait_for_token());
                if wait.is_zero() {
                    if !minute.unlimited() {
                        minute.tokens -= 1.0;
                    }
                    if !hour.unlimited() {
                        hour.tokens -= 1.0;
                    }
                    return started.elapsed();
                }
                wait
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Consume a token from both budgets only if neither is exhausted.
    pub async fn try_acquire(&self) -> bool {
        let mut guard = self.buckets.lock().await;
        let (minute, hour) = &mut *guard;
        let now = Instant::now();
        minute.refill(now);
        hour.refill(now);
        if minute.wait_for_token().is_zero() && hour.wait_for_token().is_zero() {
            if !minute.unlimited() {
                minute.tokens -= 1.0;
            }
            if !hour.unlimited() {
                hour.tokens -= 1.0;
            }
            true
        } else {
            false
        }
    }

    /// Remaining (per-minute, per-hour) tokens.
    pub async fn remaining(&self) -> (f64, f64) {
        let mut guard = self.buckets.lock().await;
        let (minute, hour) = &mut *guard;
        (minute.available(), hour.available())
    }
}

/// Enforces a minimum gap between consecutive requests.
pub struct Pacer {
    min_gap: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Pacer with the given minimum gap.
    pub fn new(min_gap: Duration) -> Self {
        Self { min_gap, last: Mutex::new(None) }
    }

    /// Sleep until `min_gap` has passed since the previous call returned.
    /// The lock is held while sleeping so callers are released one by one.
    pub async fn pace(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let since = prev.elapsed();
            if since < self.min_gap {
                sleep(self.min_gap - since).await;
            }
        }
        *last = Some(Instant::now());
    }
}
