//! Wall-clock timeout for a single attempt.
//!
//! Two enforcement modes:
//!
//! - [`TimeoutMode::Cooperative`]: the operation is handed a
//!   [`CancellationToken`] and is trusted to stop promptly once it is
//!   cancelled. The policy cancels at the deadline and then waits for the
//!   operation to acknowledge, so no work is left running unobserved.
//! - [`TimeoutMode::Preemptive`]: the operation is spawned on the runtime
//!   and abandoned at the deadline. The caller gets its timeout on schedule
//!   even if the operation never checks for cancellation, at the cost of the
//!   orphaned task running to completion in the background.

use crate::PolicyError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How the deadline is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// Cancel the token and wait for the operation to stop on its own.
    Cooperative,
    /// Abandon the spawned operation at the deadline.
    Preemptive,
}

/// Invalid timeout configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutConfigError {
    #[error("timeout limit must be > 0")]
    ZeroLimit,
}

type TimeoutCallback = dyn Fn(Duration) + Send + Sync;

/// Timeout policy bounding one operation.
#[derive(Clone)]
pub struct TimeoutPolicy {
    limit: Duration,
    mode: TimeoutMode,
    on_timeout: Option<Arc<TimeoutCallback>>,
}

impl std::fmt::Debug for TimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutPolicy")
            .field("limit", &self.limit)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl TimeoutPolicy {
    /// Cooperative timeout with the given limit.
    pub fn cooperative(limit: Duration) -> Result<Self, TimeoutConfigError> {
        Self::new(limit, TimeoutMode::Cooperative)
    }

    /// Preemptive timeout with the given limit.
    pub fn preemptive(limit: Duration) -> Result<Self, TimeoutConfigError> {
        Self::new(limit, TimeoutMode::Preemptive)
    }

    pub fn new(limit: Duration, mode: TimeoutMode) -> Result<Self, TimeoutConfigError> {
        if limit.is_zero() {
            return Err(TimeoutConfigError::ZeroLimit);
        }
        Ok(Self { limit, mode, on_timeout: None })
    }

    /// Notification fired when the deadline is hit, with the elapsed time.
    /// Observability only.
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn mode(&self) -> TimeoutMode {
        self.mode
    }

    /// Execute `operation` under the deadline.
    ///
    /// The operation receives a token that is cancelled when the deadline is
    /// reached; preemptive operations may ignore it. On timeout the result is
    /// [`PolicyError::Timeout`] with the elapsed time and the configured
    /// limit.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send + 'static,
        Op: FnOnce(CancellationToken) -> Fut,
    {
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();

        match self.mode {
            TimeoutMode::Cooperative => {
                let fut = operation(token.child_token());
                tokio::pin!(fut);
                tokio::select! {
                    result = &mut fut => result,
                    _ = tokio::time::sleep(self.limit) => {
                        token.cancel();
                        self.expired(start.elapsed());
                        // The operation owns resources; wait for it to
                        // acknowledge the cancellation before reporting.
                        let _ = fut.await;
                        Err(PolicyError::Timeout { elapsed: start.elapsed(), limit: self.limit })
                    }
                }
            }
            TimeoutMode::Preemptive => {
                let handle = tokio::spawn(operation(token.child_token()));
                match tokio::time::timeout(self.limit, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => {
                        if join_err.is_panic() {
                            std::panic::resume_unwind(join_err.into_panic());
                        }
                        // The runtime cancelled the task out from under us.
                        Err(PolicyError::Timeout {
                            elapsed: start.elapsed(),
                            limit: self.limit,
                        })
                    }
                    Err(_) => {
                        // Advisory only; the abandoned task keeps running.
                        token.cancel();
                        self.expired(start.elapsed());
                        Err(PolicyError::Timeout { elapsed: start.elapsed(), limit: self.limit })
                    }
                }
            }
        }
    }

    fn expired(&self, elapsed: Duration) {
        tracing::warn!(?elapsed, limit = ?self.limit, mode = ?self.mode, "attempt timed out");
        if let Some(cb) = &self.on_timeout {
            cb(elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn zero_limit_is_rejected() {
        assert_eq!(
            TimeoutPolicy::cooperative(Duration::ZERO).unwrap_err(),
            TimeoutConfigError::ZeroLimit
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fast_operation_passes_through() {
        let policy = TimeoutPolicy::cooperative(Duration::from_secs(5)).unwrap();
        let result: Result<u32, PolicyError<TestError>> = policy
            .execute(|_token| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn cooperative_timeout_cancels_and_waits_for_acknowledgement() {
        let observed = Arc::new(AtomicBool::new(false));
        let observed_op = observed.clone();
        let policy = TimeoutPolicy::cooperative(Duration::from_secs(5)).unwrap();

        let start = tokio::time::Instant::now();
        let result: Result<u32, PolicyError<TestError>> = policy
            .execute(|token| {
                let observed = observed_op.clone();
                async move {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(1),
                        _ = token.cancelled() => {
                            observed.store(true, Ordering::SeqCst);
                            Err(PolicyError::Inner(TestError("cancelled")))
                        }
                    }
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        assert!(observed.load(Ordering::SeqCst), "operation must see the cancellation");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn preemptive_timeout_abandons_the_operation() {
        let finished = Arc::new(AtomicBool::new(false));
        let finished_op = finished.clone();
        let policy = TimeoutPolicy::preemptive(Duration::from_secs(5)).unwrap();

        let result: Result<u32, PolicyError<TestError>> = policy
            .execute(move |_token| async move {
                // Ignores its token entirely, as a legacy call would.
                tokio::time::sleep(Duration::from_secs(10)).await;
                finished_op.store(true, Ordering::SeqCst);
                Ok(1)
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert!(!finished.load(Ordering::SeqCst));

        // The orphaned task keeps running and eventually completes.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn preemptive_success_passes_through() {
        let policy = TimeoutPolicy::preemptive(Duration::from_secs(5)).unwrap();
        let result: Result<&'static str, PolicyError<TestError>> =
            policy.execute(|_token| async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_error_reports_elapsed_and_limit() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let policy = TimeoutPolicy::preemptive(Duration::from_secs(2)).unwrap().on_timeout(
            move |elapsed| {
                assert!(elapsed >= Duration::from_secs(2));
                fired_cb.fetch_add(1, Ordering::SeqCst);
            },
        );

        let result: Result<u32, PolicyError<TestError>> = policy
            .execute(|_token| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(1)
            })
            .await;

        match result.unwrap_err() {
            PolicyError::Timeout { elapsed, limit } => {
                assert_eq!(limit, Duration::from_secs(2));
                assert!(elapsed >= limit);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inner_failure_is_not_a_timeout() {
        let policy = TimeoutPolicy::cooperative(Duration::from_secs(5)).unwrap();
        let result: Result<u32, PolicyError<TestError>> =
            policy.execute(|_token| async { Err(PolicyError::Inner(TestError("boom"))) }).await;
        assert!(matches!(result.unwrap_err(), PolicyError::Inner(TestError("boom"))));
    }
}
