//! Bounded exponential backoff for transient provider failures.
//!
//! Transient errors (throttling, network, per-call timeout) retry with an
//! exponentially growing delay; fatal errors (authorization, quota,
//! conflict, malformed state) surface immediately. A throttled response's
//! advertised retry-after overrides the computed delay.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ApplyError, Result, StrataError};

/// Maximum attempts per operation, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Base delay before the first retry.
const BASE_DELAY_MS: u64 = 500;

/// Upper bound on a single backoff delay.
const MAX_DELAY_MS: u64 = 8_000;

/// Runs an operation with bounded exponential backoff.
///
/// `subject` names the resource (or operation) for logging and the final
/// retries-exceeded error.
///
/// # Errors
///
/// Returns the original error for non-retryable failures, or
/// `MaxRetriesExceeded` once a retryable failure has exhausted its attempts.
pub async fn with_retries<T, F, Fut>(subject: &str, max_attempts: u32, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>> + Send,
{
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt >= max_attempts {
                    warn!(
                        "Giving up on '{subject}' after {attempt} attempts: {e}"
                    );
                    return Err(StrataError::Apply(ApplyError::MaxRetriesExceeded {
                        attempts: attempt,
                        address: subject.to_string(),
                    }));
                }

                let delay = backoff_delay(attempt, e.retry_delay_secs());
                debug!(
                    "Transient failure on '{subject}' (attempt {attempt}/{max_attempts}), \
                     retrying in {}ms: {e}",
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Computes the delay before the given retry attempt (1-based). An explicit
/// server-provided delay wins over the exponential schedule.
fn backoff_delay(attempt: u32, server_hint_secs: Option<u64>) -> Duration {
    if let Some(secs) = server_hint_secs
        && secs > 0
    {
        return Duration::from_secs(secs.min(MAX_DELAY_MS / 1_000));
    }

    let exp = BASE_DELAY_MS.saturating_mul(1 << (attempt - 1).min(8));
    Duration::from_millis(exp.min(MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_until_success() {
        let calls = AtomicU32::new(0);

        let result: Result<u32> = with_retries("storage.account/main", 4, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StrataError::Provider(ProviderError::network("reset")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<u32> = with_retries("storage.account/main", 4, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StrataError::Provider(ProviderError::AuthorizationDenied {
                    message: String::from("token expired"),
                }))
            }
        })
        .await;

        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_reports_max_retries() {
        let calls = AtomicU32::new(0);

        let result: Result<u32> = with_retries("storage.account/main", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StrataError::Provider(ProviderError::network("reset"))) }
        })
        .await;

        assert!(matches!(
            result,
            Err(StrataError::Apply(ApplyError::MaxRetriesExceeded {
                attempts: 3,
                ..
            }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        assert_eq!(backoff_delay(1, None), Duration::from_millis(500));
        assert_eq!(backoff_delay(2, None), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(3, None), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(10, None), Duration::from_millis(8_000));
    }

    #[test]
    fn test_backoff_delay_honors_server_hint() {
        assert_eq!(backoff_delay(1, Some(3)), Duration::from_secs(3));
    }
}
