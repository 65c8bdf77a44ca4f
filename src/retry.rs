//! Retry policy for fallible async operations.
//!
//! Semantics:
//! - Only `PolicyError::Inner(E)` failures are candidates for retry; timeout,
//!   circuit-open, bulkhead, and configuration failures propagate untouched.
//! - The `retry_on` predicate decides whether a given inner failure is
//!   transient. Non-transient failures propagate immediately.
//! - Attempts are bounded by `max_attempts` (total attempts, initial call
//!   included) and by the backoff strategy: a delay sequence that runs out
//!   ends retrying even with budget left. `retry_forever()` removes the
//!   attempt bound, leaving only the backoff to limit the run.
//! - The `on_retry` callback fires after each failed attempt, before the
//!   wait, with the failure, the computed delay, the attempt number, and the
//!   call context. Observability only; it cannot alter control flow.

use crate::{Backoff, CallContext, Jitter, PolicyError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

type RetryCallback<E> = dyn Fn(&E, Duration, usize, &CallContext) + Send + Sync;

/// Retry policy combining an attempt budget, backoff, jitter, and a
/// transience predicate.
pub struct RetryPolicy<E> {
    max_attempts: Option<usize>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_retry: Option<Arc<RetryCallback<E>>>,
    sleeper: Arc<dyn Sleeper>,
}

// Not derived: that would demand `E: Clone` for no reason.
impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter.clone(),
            retry_on: self.retry_on.clone(),
            on_retry: self.on_retry.clone(),
            sleeper: self.sleeper.clone(),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

/// Invalid retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryConfigError {
    /// The attempt budget must allow at least the initial call.
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
    /// An unbounded policy needs a backoff that eventually stops.
    #[error("retry_forever requires a bounded delay sequence or explicit opt-in")]
    UnboundedWithoutSequence,
}

impl<E> RetryPolicy<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Start building a policy with defaults (3 attempts, exponential 1s
    /// backoff, full jitter, every inner error retried).
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Retry with a fixed delay schedule, one entry per retry; the schedule
    /// running out ends the run. No jitter.
    pub fn with_delays(delays: Vec<Duration>) -> Result<Self, crate::BackoffError> {
        Ok(Self {
            max_attempts: None,
            backoff: Backoff::sequence(delays)?,
            jitter: Jitter::None,
            retry_on: Arc::new(|_| true),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Exponential backoff where retry `n` waits `2^n` seconds plus a
    /// uniform extra below one second, for up to `max_attempts` total
    /// attempts.
    pub fn jittered_exponential(max_attempts: usize) -> Result<Self, RetryConfigError> {
        RetryPolicyBuilder::new()
            .max_attempts(max_attempts)
            .backoff(Backoff::exponential(Duration::from_secs(2)))
            .jitter(Jitter::additive(Duration::from_secs(1)))
            .build()
    }

    /// Execute `operation` with retry semantics, carrying `ctx` into the
    /// retry callback.
    pub async fn execute_in<T, Fut, Op>(
        &self,
        ctx: &CallContext,
        mut operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut attempt = 1usize;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(PolicyError::Inner(e)) => {
                    if !(self.retry_on)(&e) {
                        return Err(PolicyError::Inner(e));
                    }
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(PolicyError::RetriesExhausted { attempts: attempt, last: e });
                    }
                    // Retry n waits backoff.delay(n); a None here means the
                    // schedule is spent.
                    let Some(base) = self.backoff.delay(attempt) else {
                        return Err(PolicyError::RetriesExhausted { attempts: attempt, last: e });
                    };
                    let delay = self.jitter.apply(base);
                    if let Some(cb) = &self.on_retry {
                        cb(&e, delay, attempt, ctx);
                    }
                    tracing::debug!(attempt, ?delay, error = %e, "retrying after failure");
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                // Policy-level failures are never retried here.
                Err(other) => return Err(other),
            }
        }
    }

    /// Execute without a caller-supplied context.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        self.execute_in(&CallContext::default(), operation).await
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder<E> {
    max_attempts: Option<usize>,
    backoff: Backoff,
    jitter: Jitter,
    retry_on: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    on_retry: Option<Arc<RetryCallback<E>>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<E> RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            max_attempts: Some(3),
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::full(),
            retry_on: Arc::new(|_| true),
            on_retry: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempt budget, initial call included. Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Remove the attempt budget; the backoff strategy alone bounds the run.
    pub fn retry_forever(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Delay strategy between attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Randomization applied to each delay.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Predicate deciding whether an inner failure is transient.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    /// Observability hook fired before each wait.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&E, Duration, usize, &CallContext) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(callback));
        self
    }

    /// Swap the delay mechanism (tests inject instant/recording sleepers).
    pub fn sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RetryPolicy<E>, RetryConfigError> {
        if self.max_attempts == Some(0) {
            return Err(RetryConfigError::ZeroAttempts);
        }
        if self.max_attempts.is_none() && self.backoff.retry_bound().is_none() {
            return Err(RetryConfigError::UnboundedWithoutSequence);
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            retry_on: self.retry_on,
            on_retry: self.on_retry,
            sleeper: self.sleeper,
        })
    }
}

impl<E> Default for RetryPolicyBuilder<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
