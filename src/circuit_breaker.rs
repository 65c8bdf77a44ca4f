//! Circuit breaker with a lock-free state machine.
//!
//! Closed → Open after `failure_threshold` consecutive failures; Open →
//! Half-Open once `break_duration` elapses; Half-Open → Closed on probe
//! success, back to Open on probe failure. While Open, calls fail
//! immediately with [`PolicyError::CircuitOpen`] without touching the
//! transport.
//!
//! State lives in atomics and transitions go through compare-exchange, so
//! concurrent callers race on the transition but only one wins; current
//! state can always be read without blocking. Clones share the same state
//! via `Arc`, so every handle observes the same circuit lifecycle.

use crate::{Clock, MonotonicClock, PolicyError};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Observable state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    Closed,
    /// Calls fail fast until the break duration elapses.
    Open,
    /// A limited number of probe calls test whether the endpoint recovered.
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> CircuitState {
        match raw {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Invalid breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitConfigError {
    #[error("failure_threshold must be > 0")]
    ZeroThreshold,
    #[error("break_duration must be > 0")]
    ZeroBreakDuration,
    #[error("half-open probe limit must be > 0")]
    ZeroProbeLimit,
}

/// Validated breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    break_duration: Duration,
    max_probes: usize,
}

impl CircuitBreakerConfig {
    /// Threshold of consecutive failures and the break duration; one
    /// half-open probe by default.
    pub fn new(
        failure_threshold: usize,
        break_duration: Duration,
    ) -> Result<Self, CircuitConfigError> {
        if failure_threshold == 0 {
            return Err(CircuitConfigError::ZeroThreshold);
        }
        if break_duration.is_zero() {
            return Err(CircuitConfigError::ZeroBreakDuration);
        }
        Ok(Self { failure_threshold, break_duration, max_probes: 1 })
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn break_duration(&self) -> Duration {
        self.break_duration
    }

    pub fn max_probes(&self) -> usize {
        self.max_probes
    }
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    consecutive_failures: AtomicUsize,
    opened_at_millis: AtomicU64,
    probes_in_flight: AtomicUsize,
}

type BreakCallback = dyn Fn(Duration) + Send + Sync;
type ResetCallback = dyn Fn() + Send + Sync;

/// Circuit breaker policy guarding an async operation.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    on_break: Option<Arc<BreakCallback>>,
    on_reset: Option<Arc<ResetCallback>>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Breaker opening after `failure_threshold` consecutive failures for
    /// `break_duration`.
    pub fn new(
        failure_threshold: usize,
        break_duration: Duration,
    ) -> Result<Self, CircuitConfigError> {
        Ok(Self::from_config(CircuitBreakerConfig::new(failure_threshold, break_duration)?))
    }

    /// Breaker from an already-validated config.
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(CLOSED),
                consecutive_failures: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                probes_in_flight: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(MonotonicClock::default()),
            on_break: None,
            on_reset: None,
        }
    }

    /// Override the time source (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Allow more than one concurrent half-open probe.
    pub fn with_max_probes(mut self, limit: usize) -> Result<Self, CircuitConfigError> {
        if limit == 0 {
            return Err(CircuitConfigError::ZeroProbeLimit);
        }
        self.config.max_probes = limit;
        Ok(self)
    }

    /// Notification fired when the circuit opens, with the break duration.
    /// Observability only.
    pub fn on_break<F>(mut self, callback: F) -> Self
    where
        F: Fn(Duration) + Send + Sync + 'static,
    {
        self.on_break = Some(Arc::new(callback));
        self
    }

    /// Notification fired when a probe success closes the circuit.
    pub fn on_reset<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reset = Some(Arc::new(callback));
        self
    }

    /// Current state, racy by nature but safe to read concurrently.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Execute `operation` under breaker protection.
    ///
    /// While Open, returns [`PolicyError::CircuitOpen`] carrying the
    /// consecutive-failure count and remaining break time without invoking
    /// the operation. Half-open probes beyond the probe limit are rejected
    /// the same way.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        // Releases the probe slot even if the operation panics.
        struct ProbeSlot<'a> {
            shared: &'a Shared,
        }
        impl Drop for ProbeSlot<'_> {
            fn drop(&mut self) {
                self.shared.probes_in_flight.fetch_sub(1, Ordering::Release);
            }
        }
        let mut probe: Option<ProbeSlot<'_>> = None;

        loop {
            match self.state() {
                CircuitState::Closed => break,
                CircuitState::Open => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let elapsed =
                        Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at));
                    if elapsed < self.config.break_duration {
                        return Err(self.reject(elapsed));
                    }
                    // Break expired; race to become the first half-open probe.
                    match self.shared.state.compare_exchange(
                        OPEN,
                        HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.shared.probes_in_flight.store(1, Ordering::Release);
                            probe = Some(ProbeSlot { shared: &self.shared });
                            tracing::info!("circuit breaker half-open, probing");
                            break;
                        }
                        Err(CLOSED) => break,
                        // Another caller became the probe; re-evaluate.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let occupied = self.shared.probes_in_flight.fetch_add(1, Ordering::AcqRel);
                    if occupied >= self.config.max_probes {
                        self.shared.probes_in_flight.fetch_sub(1, Ordering::Release);
                        let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                        let elapsed = Duration::from_millis(
                            self.clock.now_millis().saturating_sub(opened_at),
                        );
                        return Err(self.reject(elapsed));
                    }
                    probe = Some(ProbeSlot { shared: &self.shared });
                    break;
                }
            }
        }

        let result = operation().await;
        drop(probe);

        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        result
    }

    fn reject<E>(&self, elapsed: Duration) -> PolicyError<E> {
        PolicyError::CircuitOpen {
            failures: self.shared.consecutive_failures.load(Ordering::Acquire),
            retry_after: self.config.break_duration.saturating_sub(elapsed),
        }
    }

    /// A success while Closed clears the consecutive-failure streak; a probe
    /// success closes the circuit and fires `on_reset`.
    fn record_success(&self) {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.shared.probes_in_flight.store(0, Ordering::Release);
                    self.shared.consecutive_failures.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!("circuit breaker reset to closed");
                    if let Some(cb) = &self.on_reset {
                        cb();
                    }
                }
            }
            CircuitState::Closed => {
                self.shared.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .shared
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.trip(failures, "probe failed, circuit re-opened");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.trip(failures, "failure threshold reached, circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn trip(&self, failures: usize, message: &'static str) {
        self.shared.probes_in_flight.store(0, Ordering::Release);
        self.shared.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
        tracing::warn!(failures, break_duration = ?self.config.break_duration, "{message}");
        if let Some(cb) = &self.on_break {
            cb(self.config.break_duration);
        }
    }
}
