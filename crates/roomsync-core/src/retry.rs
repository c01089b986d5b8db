use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::error::SessionError;

/// Exponential backoff used between bounded retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Sleep durations used by [`ratelimited`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// Added on top of a server-suggested wait.
    pub margin: Duration,
    /// Used when the server gives no suggestion.
    pub fallback: Duration,
}

impl RateLimitPolicy {
    pub fn delay_for(&self, err: &SessionError) -> Duration {
        match err.retry_after() {
            Some(hint) => hint + self.margin,
            None => self.fallback,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            margin: Duration::from_millis(100),
            fallback: Duration::from_secs(5),
        }
    }
}

/// Retry `op` up to `retries` extra times while it fails transiently.
///
/// Non-transient failures are returned immediately without touching the
/// budget. When the budget runs out the last error is surfaced.
pub async fn retry_task<T, F, Fut>(retries: u32, op: F) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    retry_task_with(&RetryPolicy::default(), retries, op).await
}

/// [`retry_task`] with an explicit backoff policy.
pub async fn retry_task_with<T, F, Fut>(
    policy: &RetryPolicy,
    retries: u32,
    mut op: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retries => {
                let delay = policy.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    attempt,
                    retries,
                    delay_ms = delay.as_millis() as u64,
                    code = %err.code,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Retry `op` for as long as the homeserver keeps rate limiting it.
///
/// Every other outcome, success or failure, is passed through unchanged.
pub async fn ratelimited<T, F, Fut>(op: F) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    ratelimited_with(&RateLimitPolicy::default(), op).await
}

/// [`ratelimited`] with explicit sleep durations.
pub async fn ratelimited_with<T, F, Fut>(
    policy: &RateLimitPolicy,
    mut op: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    loop {
        match op().await {
            Err(err) if err.is_rate_limited() => {
                let delay = policy.delay_for(&err);
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    hinted = err.retry_after_ms.is_some(),
                    "rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::error::SessionErrorCategory;

    fn network_error() -> SessionError {
        SessionError::transport("connection reset")
    }

    fn server_error() -> SessionError {
        SessionError::new(SessionErrorCategory::Server, "M_FORBIDDEN", "nope")
    }

    fn rate_limit(hint: Option<Duration>) -> SessionError {
        let err = SessionError::new(
            SessionErrorCategory::RateLimited,
            "M_LIMIT_EXCEEDED",
            "too many requests",
        );
        match hint {
            Some(hint) => err.with_retry_after(hint),
            None => err,
        }
    }

    #[test]
    fn starts_with_base_delay() {
        let policy = RetryPolicy::new(250, 8_000);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
    }

    #[test]
    fn scales_exponentially_and_caps() {
        let policy = RetryPolicy::new(100, 1_000);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(1_000));
    }

    #[test]
    fn rate_limit_delay_prefers_hint_plus_margin() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.delay_for(&rate_limit(Some(Duration::from_secs(2)))),
            Duration::from_millis(2_100)
        );
        assert_eq!(policy.delay_for(&rate_limit(None)), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_never_retries() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = retry_task(0, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(network_error())
        })
        .await;

        assert_eq!(result.expect_err("must fail").code, "transport_error");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures_within_budget() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result = retry_task(3, move || async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(network_error()) } else { Ok(n) }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_when_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = retry_task(2, move || async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::transport(format!("failure {n}")))
        })
        .await;

        let err = result.expect_err("budget exhausted");
        assert_eq!(err.message, "failure 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<(), _> = retry_task(5, move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(server_error())
        })
        .await;

        assert_eq!(result.expect_err("must fail").code, "M_FORBIDDEN");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_at_least_the_hint_before_retrying() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let started = Instant::now();
        let result = ratelimited(move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(rate_limit(Some(Duration::from_secs(3))))
            } else {
                Ok("synced")
            }
        })
        .await;

        assert_eq!(result.expect("second attempt succeeds"), "synced");
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unhinted_rate_limit_uses_fallback() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let started = Instant::now();
        let result = ratelimited(move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(rate_limit(None))
            } else {
                Ok(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn passes_other_errors_through() {
        let result: Result<(), _> = ratelimited(|| async { Err(network_error()) }).await;
        assert_eq!(
            result.expect_err("must fail").category,
            SessionErrorCategory::Network
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_do_not_consume_bounded_budget() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result = retry_task(0, move || {
            ratelimited(move || async move {
                match calls_ref.fetch_add(1, Ordering::SeqCst) {
                    0..=3 => Err(rate_limit(Some(Duration::from_millis(10)))),
                    n => Ok(n),
                }
            })
        })
        .await;

        assert_eq!(result.expect("rate limits absorbed"), 4);
    }
}
