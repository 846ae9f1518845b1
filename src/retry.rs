//! Umbrella retry wrapper: exponential backoff with full jitter.
//! Every recoverable operation (BLE reconnect, diff pulls, uploads) goes
//! through `with_backoff` instead of rolling its own loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that know whether a retry could help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Backoff parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts including the first one. 0 means retry forever.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 6,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn forever(self) -> Self {
        Self {
            max_attempts: 0,
            ..self
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64 << attempt.min(20))
            .min(self.max_delay_ms);
        if self.jitter && exp > 0 {
            // full jitter: uniform in [exp/2, exp]
            let low = exp / 2;
            Duration::from_millis(rand::thread_rng().gen_range(low..=exp))
        } else {
            Duration::from_millis(exp)
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt + 1 >= self.max_attempts
    }
}

/// Outcome of a retried operation that may be cancelled.
#[derive(Debug)]
pub enum RetryError<E> {
    Cancelled,
    Failed(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Cancelled => write!(f, "cancelled"),
            RetryError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, runs out of
/// attempts, or `cancel` fires.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    op_name: &'static str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let result = tokio::select! {
            r = op() => r,
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() || policy.exhausted(attempt) => {
                return Err(RetryError::Failed(e));
            }
            Err(e) => {
                let wait = policy.delay(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky transient={}", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_ms: 1,
            max_delay_ms: 2,
            max_attempts: 4,
            jitter: false,
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy {
            base_ms: 100,
            max_delay_ms: 1000,
            max_attempts: 0,
            jitter: false,
        };
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(2), Duration::from_millis(400));
        assert_eq!(p.delay(10), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_delay_stays_in_window() {
        let p = RetryPolicy::default();
        for _ in 0..50 {
            let d = p.delay(1).as_millis() as u64;
            assert!((500..=1000).contains(&d));
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = with_backoff(&fast(), "test", &CancellationToken::new(), || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(true))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert!(matches!(out, Ok(7)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Result<(), _> = with_backoff(&fast(), "test", &CancellationToken::new(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(false))
            }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out: Result<(), _> = with_backoff(&fast(), "test", &CancellationToken::new(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Flaky(true))
            }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_token_stops_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        let out: Result<(), RetryError<Flaky>> =
            with_backoff(&fast(), "test", &token, || async { Err(Flaky(true)) }).await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
    }
}
