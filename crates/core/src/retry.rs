use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{RetryPolicySettings, RetrySettings};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    name: &'static str,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(
        name: &'static str,
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            name,
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    pub fn from_settings(name: &'static str, settings: &RetryPolicySettings) -> Self {
        Self::new(
            name,
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
    }

    pub fn no_retry(name: &'static str) -> Self {
        Self::new(name, 1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based): doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = self.backoff(attempt);
            warn!(
                event = "retry.scheduled",
                policy = self.name,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retry.scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
            attempt += 1;
        }
    }
}

/// Supplies the policies used for chunk transfers and for remote assertions.
pub trait RetryPolicyFactory: Send + Sync {
    fn chunk_upload_policy(&self) -> RetryPolicy;

    fn assert_policy(&self) -> RetryPolicy;
}

#[derive(Debug, Clone)]
pub struct DefaultRetryPolicies {
    upload: RetryPolicy,
    assert: RetryPolicy,
}

impl DefaultRetryPolicies {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            upload: RetryPolicy::from_settings("chunk_upload", &settings.upload),
            assert: RetryPolicy::from_settings("remote_assert", &settings.assert),
        }
    }
}

impl Default for DefaultRetryPolicies {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

impl RetryPolicyFactory for DefaultRetryPolicies {
    fn chunk_upload_policy(&self) -> RetryPolicy {
        self.upload.clone()
    }

    fn assert_policy(&self) -> RetryPolicy {
        self.assert.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            "test",
            attempts,
            Duration::from_millis(1),
            Duration::from_millis(4),
        )
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy::new(
            "test",
            10,
            Duration::from_millis(100),
            Duration::from_millis(500),
        );
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(500));
        assert_eq!(p.backoff(64), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = fast_policy(3)
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if attempt < 3 {
                        Err(Error::Timeout { seconds: 1 })
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let err = fast_policy(2)
            .run(&CancellationToken::new(), |attempt| async move {
                Err::<(), _>(Error::Storage {
                    provider: "test.mem".to_string(),
                    status_code: Some(500),
                    message: format!("attempt {attempt}"),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        assert!(err.to_string().contains("attempt 2"));
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(5)
            .run(&CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(Error::Cancelled) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::new("test", 5, Duration::from_secs(60), Duration::from_secs(60));
        let err = policy
            .run(&cancel, |_| async { Err::<(), _>(Error::Timeout { seconds: 1 }) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
