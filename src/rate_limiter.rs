//! Dispatch rate limiting. One limiter per task list, shared by every
//! producer; the rate tracks the latest poller-reported value under a
//! configured ceiling, last writer wins.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        if self.rate.is_infinite() {
            self.tokens = self.burst;
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
    }
}

pub struct RateLimiter {
    ceiling: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// A limiter starting wide open at the ceiling.
    pub fn new(ceiling: f64) -> Self {
        let rate = ceiling;
        Self {
            ceiling,
            bucket: Mutex::new(Bucket {
                rate,
                burst: burst_for(rate),
                tokens: burst_for(rate),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.bucket.lock().unwrap().rate
    }

    /// Apply a poller-reported dispatch rate, clamped to the ceiling. No-op
    /// when the effective rate is unchanged, so repeated polls from the same
    /// worker do not reset the bucket.
    pub fn update_rate(&self, reported: Option<f64>) {
        let effective = reported.unwrap_or(f64::INFINITY).min(self.ceiling);
        let mut bucket = self.bucket.lock().unwrap();
        if bucket.rate == effective {
            return;
        }
        let now = Instant::now();
        bucket.refill(now);
        bucket.rate = effective;
        bucket.burst = burst_for(effective);
        bucket.tokens = bucket.tokens.min(bucket.burst);
    }

    /// Take one token without waiting. Returns false when rate limited.
    pub fn try_consume(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap();
        bucket.refill(Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then take it.
    pub async fn consume(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().unwrap();
                bucket.refill(Instant::now());
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                if bucket.rate <= 0.0 {
                    // A zero rate never refills; poll for an update.
                    Duration::from_millis(100)
                } else {
                    Duration::from_secs_f64(((1.0 - bucket.tokens) / bucket.rate).min(1.0))
                }
            };
            tokio::time::sleep(wait).await;
        }
    }
}

fn burst_for(rate: f64) -> f64 {
    if rate.is_infinite() {
        f64::MAX
    } else {
        rate.max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_by_default() {
        let limiter = RateLimiter::new(f64::INFINITY);
        for _ in 0..10_000 {
            assert!(limiter.try_consume());
        }
    }

    #[test]
    fn last_writer_wins_and_ceiling_clamps() {
        let limiter = RateLimiter::new(100.0);
        limiter.update_rate(Some(10.0));
        assert_eq!(limiter.rate(), 10.0);
        limiter.update_rate(Some(500.0));
        assert_eq!(limiter.rate(), 100.0);
        limiter.update_rate(None);
        assert_eq!(limiter.rate(), 100.0);
    }

    #[test]
    fn denies_once_the_burst_is_spent() {
        let limiter = RateLimiter::new(2.0);
        limiter.update_rate(Some(2.0));
        assert!(limiter.try_consume());
        assert!(limiter.try_consume());
        assert!(!limiter.try_consume());
    }

    #[tokio::test]
    async fn consume_waits_for_refill() {
        let limiter = RateLimiter::new(50.0);
        limiter.update_rate(Some(50.0));
        while limiter.try_consume() {}
        // Exhausted; the next consume needs wall time to pass.
        let start = Instant::now();
        limiter.consume().await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
