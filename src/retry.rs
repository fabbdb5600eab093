//! Retry with exponential backoff for persistence operations.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Backoff policy. `expiration` bounds total elapsed time across attempts;
/// `max_attempts` of zero means unbounded attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: usize,
    pub expiration: Option<Duration>,
}

impl RetryPolicy {
    /// Policy applied to every store call in the matching core.
    pub fn persistence() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(10),
            max_attempts: 0,
            expiration: Some(Duration::from_secs(30)),
        }
    }

    fn interval_for(&self, attempt: usize) -> Duration {
        let factor = self.backoff_coefficient.powi(attempt as i32);
        let next = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(next.min(self.max_interval.as_secs_f64()))
    }
}

/// Run `op` until it succeeds, the error stops being retryable, or the policy
/// is exhausted. Returns the final error in the failure cases.
pub async fn retry<T, E, F, Fut, R>(policy: &RetryPolicy, is_retryable: R, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if !is_retryable(&err) {
                    return Err(err);
                }
                if policy.max_attempts > 0 && attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let wait = policy.interval_for(attempt);
                if let Some(expiration) = policy.expiration {
                    if started.elapsed() + wait >= expiration {
                        return Err(err);
                    }
                }
                attempt += 1;
                tokio::time::sleep(wait).await;
            }
        }
    }
}
