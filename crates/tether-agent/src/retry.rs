//! Retry with backoff.

use std::future::Future;
use std::time::Duration;
use tether_core::{Error, Result};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Delay between consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `unit` times 1, 1, 2, 3, 5, 8... capped at `max`.
    Fibonacci { unit: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Fibonacci { unit, max } => {
                let factor = fibonacci(attempt).min(u32::MAX as u64) as u32;
                unit.saturating_mul(factor).min(max)
            }
        }
    }
}

/// 1-based Fibonacci number: 1, 1, 2, 3, 5...
pub fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n.max(1) {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Result reporting: 5 attempts with 1s, 1s, 2s, 3s between them.
    pub fn reporting() -> Self {
        Self {
            max_attempts: Some(5),
            backoff: Backoff::Fibonacci {
                unit: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
        }
    }

    /// Registration: unlimited attempts at a fixed interval.
    pub fn registration(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff: Backoff::Fixed(interval),
        }
    }

    /// REST heartbeat: one quick retry before waiting for the next tick.
    pub fn heartbeat() -> Self {
        Self {
            max_attempts: Some(2),
            backoff: Backoff::Fixed(Duration::from_secs(5)),
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Run `op` until it succeeds, `should_retry` rejects the error, or the
/// attempts run out. Returns the last error. No sleep follows the final attempt.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                if !should_retry(&e) || !policy.allows(attempt) {
                    return Err(e);
                }
                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation = label,
                    attempt,
                    max_attempts = ?policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
