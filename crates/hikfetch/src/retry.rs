//! Bounded retries for device requests.
//!
//! Search pages, discovery probes and recording downloads all go through
//! [`retry_with_backoff`]. Failures are classified with
//! [`FetchError::is_retryable`]; anything permanent is returned at once.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{FetchError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after it.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to half of `base_delay` on top of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    /// Three attempts in total.
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after the failed attempt number `failed` (0-based), never above
    /// `max_delay`.
    fn backoff(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        let headroom = self.max_delay.saturating_sub(delay);
        let spread = (self.base_delay / 2).min(headroom);
        if !self.jitter || spread.is_zero() {
            return delay;
        }

        let extra = rand::rng().random_range(Duration::ZERO..spread);
        delay + extra
    }
}

/// Run `attempt` until it succeeds, fails permanently or the policy's budget
/// is spent.
///
/// `attempt` gets the 0-based attempt number. A cancelled `token` ends the
/// loop with [`FetchError::Cancelled`], also in the middle of a backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    attempt: F,
) -> Result<T>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut n = 0;
    loop {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let err = match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || n >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.backoff(n);
        n += 1;
        warn!(
            attempt = n,
            of = policy.attempts(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "Transient failure, retrying"
        );

        tokio::select! {
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        }
    }

    #[test]
    fn default_budget_is_three_attempts() {
        assert_eq!(RetryPolicy::default().attempts(), 3);
        assert_eq!(RetryPolicy::none().attempts(), 1);
    }

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (0..6).map(|n| policy.backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_half_a_base_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..64 {
            let delay = policy.backoff(1);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay < Duration::from_millis(2500));
            assert!(policy.backoff(9) <= policy.max_delay);
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_returned_at_once() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&quick(3), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(FetchError::protocol("responseStatus=false")) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Protocol { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transient_failure_uses_the_whole_budget() {
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&quick(2), &token, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { Err(FetchError::timeout("no data")) }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let token = CancellationToken::new();
        let result = retry_with_backoff(&quick(2), &token, |n| async move {
            if n == 0 {
                Err(FetchError::timeout("no data"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_backoff() {
        let token = CancellationToken::new();
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let result: Result<()> = retry_with_backoff(&policy, &token, |_| async {
            Err(FetchError::timeout("no data"))
        })
        .await;
        assert!(matches!(result, Err(FetchError::Cancelled)));
    }
}
