//! Retry-with-backoff helper for fragile I/O.
//!
//! Used by the IMAP connector and the OAuth engine. Only errors the
//! caller classifies as transient are retried; everything else fails
//! on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{MailError, Result};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following `attempt` (0-based):
    /// base * 2^attempt + jitter, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = if self.max_jitter.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64)
        };
        (exp + Duration::from_millis(jitter_ms)).min(self.cap)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between
/// transient failures. The operation receives the 1-based attempt
/// number so callers can log it.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<MailError> = None;
    for attempt in 0..policy.max_attempts {
        match op(attempt + 1).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| MailError::Other("retry exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_jitter: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry(fast_policy(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MailError::Network("connection reset".into()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_fails_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry(fast_policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MailError::auth("bad password")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry(fast_policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MailError::Timeout("read timed out".into())) }
        })
        .await;
        assert!(matches!(result, Err(MailError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }
}
