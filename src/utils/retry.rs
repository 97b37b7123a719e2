//! Bounded-attempt backoff policy.
//!
//! Fragment connects, the sender's listener bind, and the explore handshake
//! all retry the same way: a fixed number of attempts with a delay that
//! grows by a constant factor. One policy value parameterizes them all
//! instead of each call site hand-rolling its loop.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry schedule: `attempts` tries, sleeping `base_delay * growth^n`
/// between attempt `n` and `n + 1`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub growth: u32,
}

impl RetryPolicy {
    /// The connect/bind schedule: 5 attempts, 1000 ms base, doubling.
    pub fn connect() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(1000),
            growth: 2,
        }
    }

    pub fn new(attempts: u32, base_delay: Duration, growth: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            growth,
        }
    }

    /// Delay to sleep after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * self.growth.saturating_pow(attempt)
    }

    /// Run `op` until it succeeds or attempts are exhausted, sleeping the
    /// scheduled delay between tries. Returns the last error on exhaustion.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after failure");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
