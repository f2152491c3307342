//! # Retry & Backoff
//!
//! Exponential backoff shared by the control-plane `*_with_retry` calls and
//! the reconnection loop.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  BACKOFF STRATEGY (Exponential with Jitter)                            │
//! │  ───────────────────────────────────────────                           │
//! │  Attempt 1: 1s   (±50%)                                                │
//! │  Attempt 2: 2s   (±50%)                                                │
//! │  Attempt 3: 4s   (±50%)                                                │
//! │  ...                                                                    │
//! │  Capped at 60s   (±50%)                                                │
//! │                                                                         │
//! │  Only transient errors (is_retryable) are retried. Auth failures and   │
//! │  revocation return immediately.                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{UplinkError, UplinkResult};

impl RetryPolicy {
    /// Builds a fresh backoff sequence for this policy.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_elapsed_time: None,
            ..Default::default()
        };
        // current_interval is only taken from initial_interval on reset
        backoff.reset();
        backoff
    }

    fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> UplinkResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(UplinkError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, runs out
/// of attempts, or `cancel` fires.
///
/// The closure is called once per attempt, so anything that must stay stable
/// across attempts (a batch id, say) should be captured, not generated inside.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &'static str,
    mut op: F,
) -> UplinkResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = UplinkResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(UplinkError::Cancelled);
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UplinkError::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };

        if policy.attempts_exhausted(attempt) {
            warn!(operation, attempt, error = %err, "Giving up after max attempts");
            return Err(err);
        }

        let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
        warn!(operation, attempt, ?delay, error = %err, "Transient failure, backing off");
        sleep_or_cancel(delay, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(50),
            max_attempts,
            max_auth_refreshes: 3,
        }
    }

    #[test]
    fn test_backoff_starts_at_initial_interval() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();
        let first = backoff.next_backoff().unwrap();
        // 1s ±50%
        assert!(first >= Duration::from_millis(500), "{first:?}");
        assert!(first <= Duration::from_millis(1500), "{first:?}");
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        let mut backoff = policy.backoff();
        let mut last = Duration::ZERO;
        for _ in 0..20 {
            last = backoff.next_backoff().unwrap();
        }
        assert!(last <= Duration::from_secs(90), "{last:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let result = retry_transient(&fast_policy(0), &cancel, "test", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UplinkError::Network("reset".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let result: UplinkResult<()> = retry_transient(&fast_policy(0), &cancel, "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(UplinkError::AuthFailed("expired".into()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_auth_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();

        let result: UplinkResult<()> = retry_transient(&fast_policy(4), &cancel, "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(UplinkError::Timeout(10))
            }
        })
        .await;

        assert!(matches!(result, Err(UplinkError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(60),
            max_attempts: 0,
            max_auth_refreshes: 3,
        };

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result: UplinkResult<()> = retry_transient(&policy, &cancel, "test", || async {
            Err(UplinkError::Network("down".into()))
        })
        .await;

        assert!(matches!(result, Err(UplinkError::Cancelled)));
    }
}
