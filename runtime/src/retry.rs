//! Bounded retry for transient failures.

use std::future::Future;
use std::time::Duration;

use a3s_build_core::error::Result;

/// Retry settings.
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Attempts after the first
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent.
pub async fn retry_if_necessary<T, F, Fut>(
    what: &str,
    options: RetryOptions,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < options.max_retries => {
                attempt += 1;
                tracing::warn!(
                    operation = what,
                    attempt,
                    max = options.max_retries,
                    error = %e,
                    "Retrying after transient failure"
                );
                tokio::time::sleep(options.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_build_core::error::BuildError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryOptions {
        RetryOptions {
            max_retries,
            delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_if_necessary("fetch", fast(3), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BuildError::Network {
                    url: "u".to_string(),
                    message: "reset".to_string(),
                })
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_if_necessary("fetch", fast(2), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::Network {
                url: "u".to_string(),
                message: "down".to_string(),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_if_necessary("fetch", fast(5), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BuildError::PolicyDenied("blocked".to_string()))
        })
        .await;
        assert!(matches!(result, Err(BuildError::PolicyDenied(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
