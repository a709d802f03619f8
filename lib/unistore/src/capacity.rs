//! Token-bucket throttle pacing requests against backend throughput quotas.
//!
//! Refill is lazy: tokens are recomputed from elapsed wall time at each
//! consume call, never by a background timer.

use std::time::Duration;

use parking_lot::Mutex;
// The tokio clock respects a paused test runtime and falls back to wall time
// outside one.
use tokio::time::Instant;

/// Token bucket state. `0 <= count <= max` always holds.
#[derive(Debug)]
pub struct TokenBucket {
    /// Tokens granted per refill interval.
    rate: f64,
    /// Burst ceiling.
    max: f64,
    count: f64,
    last_refill: Instant,
    interval: Duration,
    /// Running total of tokens requested, granted or not.
    total: u64,
}

impl TokenBucket {
    pub fn new(rate: f64, max: f64, interval: Duration) -> Self {
        let max = max.max(rate);
        TokenBucket {
            rate,
            max,
            count: max,
            last_refill: Instant::now(),
            interval,
            total: 0,
        }
    }

    /// A zero-rate or zero-burst bucket never throttles.
    pub fn is_unlimited(&self) -> bool {
        self.rate <= 0.0 || self.max <= 0.0
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed();
        if elapsed.is_zero() {
            return;
        }
        let refill = self.rate * elapsed.as_secs_f64() / self.interval.as_secs_f64();
        if refill > 0.0 {
            self.count = (self.count + refill).min(self.max);
            self.last_refill = Instant::now();
        }
    }

    /// Attempt to take `n` tokens; commits the debit only when enough are
    /// available. The requested total is recorded either way.
    pub fn consume(&mut self, n: f64) -> bool {
        self.total = self.total.saturating_add(n.ceil() as u64);
        self.take(n)
    }

    /// Like `consume` without recording the request. Retries of an already
    /// recorded request go through here.
    fn take(&mut self, n: f64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill();
        if self.count >= n {
            self.count -= n;
            true
        } else {
            false
        }
    }

    /// Minimum wait until `n` tokens will have refilled.
    pub fn delay(&self, n: f64) -> Duration {
        if self.is_unlimited() || self.count >= n {
            return Duration::ZERO;
        }
        let missing = (n.min(self.max) - self.count).max(0.0);
        Duration::from_secs_f64(missing / self.rate * self.interval.as_secs_f64())
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.count
    }

    pub fn total_requested(&self) -> u64 {
        self.total
    }
}

/// Shared throttle handle built by `Db::get_capacity`.
#[derive(Debug)]
pub struct Capacity {
    bucket: Mutex<TokenBucket>,
}

impl Capacity {
    pub fn new(rate: f64, max: f64) -> Self {
        Capacity {
            bucket: Mutex::new(TokenBucket::new(rate, max, Duration::from_secs(1))),
        }
    }

    pub fn consume(&self, n: f64) -> bool {
        self.bucket.lock().consume(n)
    }

    pub fn delay(&self, n: f64) -> Duration {
        self.bucket.lock().delay(n)
    }

    pub fn total_requested(&self) -> u64 {
        self.bucket.lock().total_requested()
    }

    /// Take `n` tokens, suspending this operation until the bucket refills.
    /// Other operations proceed independently.
    pub async fn check(&self, n: f64) {
        if self.consume(n) {
            return;
        }
        loop {
            let delay = self.delay(n);
            if delay.is_zero() {
                // Raced with another consumer; let it finish first.
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(delay).await;
            }
            if self.bucket.lock().take(n) {
                return;
            }
        }
    }
}
