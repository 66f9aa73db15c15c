//! Bounded retry with exponential backoff.
//!
//! Transient store failures are retried up to `max_attempts` times with
//! jittered exponential delays. A version conflict is retried exactly once,
//! immediately, since the operation re-reads everything it writes.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use accrue_core::error::EngineError;

/// Default number of attempts for transient failures.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(50);
/// Default ceiling on a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// `backoff(retry)` with equal jitter: uniformly in `[d/2, d]`.
    fn jittered(&self, retry: u32) -> Duration {
        let d = self.backoff(retry);
        let half = d / 2;
        let extra_ms = half.as_millis() as u64;
        if extra_ms == 0 {
            return d;
        }
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=extra_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut transient_retries = 0u32;
        let mut conflict_retried = false;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(EngineError::TransientStore(msg)) => {
                    if transient_retries + 1 >= max_attempts {
                        warn!(op = label, attempts = max_attempts, "giving up after transient failures: {msg}");
                        return Err(EngineError::TransientStore(msg));
                    }
                    let delay = self.jittered(transient_retries);
                    debug!(op = label, retry = transient_retries + 1, ?delay, "transient store failure: {msg}");
                    transient_retries += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(EngineError::Conflict(msg)) if !conflict_retried => {
                    debug!(op = label, "version conflict, retrying once: {msg}");
                    conflict_retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
