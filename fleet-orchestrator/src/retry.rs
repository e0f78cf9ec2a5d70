use std::future::Future;
use std::time::Duration;

/// Bounded retry with exponential backoff: the delay after attempt `n`
/// (0-based) is `initial_delay * multiplier^n`. No sleep follows the last
/// attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            multiplier: 2,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.initial_delay
            .saturating_mul(self.multiplier.saturating_pow(attempt))
    }

    /// Runs `op` until it succeeds or attempts are exhausted, returning the
    /// last error. `label` prefixes the warnings logged between attempts.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 >= self.max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "[{}] attempt {}/{} failed: {}; retrying in {:?}",
                        label,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(10))
    }
}
