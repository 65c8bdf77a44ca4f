//! Fallback: substitute a degraded answer when the wrapped call fails.
//!
//! The outermost layer of a typical stack. Whatever the inner layers give up
//! with — exhausted retries, an open circuit, a timeout — the fallback turns
//! into a usable value so the caller never sees the failure at all.

use crate::{CallContext, PolicyError};
use std::future::Future;
use std::sync::Arc;

type Substitute<T, E> = dyn Fn(&PolicyError<E>) -> T + Send + Sync;
type HandlePredicate<E> = dyn Fn(&PolicyError<E>) -> bool + Send + Sync;
type FallbackCallback<E> = dyn Fn(&PolicyError<E>, &CallContext) + Send + Sync;

/// Fallback policy producing a substitute `T` for handled failures.
pub struct FallbackPolicy<T, E> {
    substitute: Arc<Substitute<T, E>>,
    handles: Arc<HandlePredicate<E>>,
    on_fallback: Option<Arc<FallbackCallback<E>>>,
}

// Not derived: that would demand `T: Clone` and `E: Clone` on the handles.
impl<T, E> Clone for FallbackPolicy<T, E> {
    fn clone(&self) -> Self {
        Self {
            substitute: self.substitute.clone(),
            handles: self.handles.clone(),
            on_fallback: self.on_fallback.clone(),
        }
    }
}

impl<T, E> std::fmt::Debug for FallbackPolicy<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPolicy").finish_non_exhaustive()
    }
}

impl<T, E> FallbackPolicy<T, E>
where
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Substitute a fixed value for any failure.
    pub fn value(fallback: T) -> Self
    where
        T: Clone + Sync + 'static,
    {
        Self::compute(move |_| fallback.clone())
    }

    /// Derive the substitute from the failure itself.
    pub fn compute<F>(substitute: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> T + Send + Sync + 'static,
    {
        Self {
            substitute: Arc::new(substitute),
            handles: Arc::new(|_| true),
            on_fallback: None,
        }
    }

    /// Restrict which failures are substituted; everything else propagates.
    pub fn handle<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PolicyError<E>) -> bool + Send + Sync + 'static,
    {
        self.handles = Arc::new(predicate);
        self
    }

    /// Notification fired when a failure is substituted. Observability only.
    pub fn on_fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PolicyError<E>, &CallContext) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(callback));
        self
    }

    /// Execute `operation`, substituting handled failures.
    pub async fn execute_in<Fut, Op>(
        &self,
        context: &CallContext,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        match operation().await {
            Ok(value) => Ok(value),
            Err(error) if (self.handles)(&error) => {
                tracing::debug!(key = context.key(), error = %error, "substituting fallback");
                if let Some(cb) = &self.on_fallback {
                    cb(&error, context);
                }
                Ok((self.substitute)(&error))
            }
            Err(error) => Err(error),
        }
    }

    /// [`execute_in`](Self::execute_in) with an anonymous context.
    pub async fn execute<Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        self.execute_in(&CallContext::default(), operation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn success_is_untouched() {
        let policy: FallbackPolicy<String, TestError> =
            FallbackPolicy::value("degraded".to_string());
        let out = policy.execute(|| async { Ok("live".to_string()) }).await.unwrap();
        assert_eq!(out, "live");
    }

    #[tokio::test]
    async fn failure_yields_the_substitute() {
        let policy: FallbackPolicy<String, TestError> =
            FallbackPolicy::value("Please try again later".to_string());
        let out = policy
            .execute(|| async { Err(PolicyError::Inner(TestError("503"))) })
            .await
            .unwrap();
        assert_eq!(out, "Please try again later");
    }

    #[tokio::test]
    async fn substitute_can_inspect_the_failure() {
        let policy: FallbackPolicy<String, TestError> = FallbackPolicy::compute(|err| {
            if err.is_circuit_open() {
                "circuit open, backing off".to_string()
            } else {
                "generic fallback".to_string()
            }
        });

        let out = policy
            .execute(|| async {
                Err(PolicyError::CircuitOpen { failures: 2, retry_after: Duration::from_secs(30) })
            })
            .await
            .unwrap();
        assert_eq!(out, "circuit open, backing off");

        let out = policy
            .execute(|| async { Err(PolicyError::Inner(TestError("boom"))) })
            .await
            .unwrap();
        assert_eq!(out, "generic fallback");
    }

    #[tokio::test]
    async fn unhandled_failures_propagate() {
        let policy: FallbackPolicy<u32, TestError> =
            FallbackPolicy::value(0).handle(|err| err.is_timeout());

        let err = policy
            .execute(|| async { Err(PolicyError::Inner(TestError("boom"))) })
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Inner(TestError("boom"))));

        let out = policy
            .execute(|| async {
                Err(PolicyError::Timeout {
                    elapsed: Duration::from_secs(6),
                    limit: Duration::from_secs(5),
                })
            })
            .await
            .unwrap();
        assert_eq!(out, 0);
    }

    #[tokio::test]
    async fn on_fallback_sees_the_error_and_context() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();
        let policy: FallbackPolicy<u32, TestError> =
            FallbackPolicy::value(7).on_fallback(move |err, ctx| {
                assert!(err.as_inner().is_some());
                assert_eq!(ctx.key(), "orders");
                fired_cb.fetch_add(1, Ordering::SeqCst);
            });

        let ctx = CallContext::new("orders");
        let out = policy
            .execute_in(&ctx, || async { Err(PolicyError::Inner(TestError("boom"))) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
