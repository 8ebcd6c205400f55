use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::client::ApiError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt.min(16));
        let exp = base_ms.saturating_mul(factor);
        let delay_ms = if self.jitter { rng.gen_range(0..=exp) } else { exp };
        Duration::from_millis(delay_ms)
    }
}

/// Runs `attempt_fn` up to `max_attempts` times total, sleeping
/// `base_delay * multiplier^attempt` between attempts. Only retryable
/// errors are retried; terminal errors and cancellation propagate
/// immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "upload attempt {}/{} failed: {err}; retrying in {}ms",
                    attempt + 1,
                    attempts,
                    delay.as_millis()
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
