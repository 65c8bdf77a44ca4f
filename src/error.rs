//! Unified error type shared by every policy.
//!
//! All policies execute operations of shape `Result<T, PolicyError<E>>` where
//! `E` is the caller's transport-level error. Policies layer their own failure
//! modes on top as distinct variants so callers (and the retry predicate) can
//! tell a broken circuit from a slow endpoint.

use std::time::Duration;
use thiserror::Error;

/// Failure surfaced by a policy or by the wrapped operation itself.
#[derive(Debug, Error)]
pub enum PolicyError<E> {
    /// The attempt exceeded its wall-clock bound.
    #[error("operation timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        /// Time spent before the policy gave up.
        elapsed: Duration,
        /// Configured bound.
        limit: Duration,
    },

    /// The circuit breaker short-circuited the call without contacting the
    /// transport.
    #[error("circuit open after {failures} consecutive failures; probe allowed in {retry_after:?}")]
    CircuitOpen {
        /// Consecutive failures observed when the circuit opened.
        failures: usize,
        /// Remaining break time before a half-open probe is allowed.
        retry_after: Duration,
    },

    /// The bulkhead rejected the call at capacity.
    #[error("bulkhead full ({in_flight} in flight, max {max})")]
    BulkheadFull { in_flight: usize, max: usize },

    /// Every permitted attempt failed; carries the final failure.
    #[error("retries exhausted after {attempts} attempts; last error: {last}")]
    RetriesExhausted { attempts: usize, last: E },

    /// A policy name was looked up that the registry does not contain.
    /// Configuration error: fails the requesting call immediately, never
    /// retried.
    #[error("no policy named {name:?} in the registry")]
    UnknownPolicy { name: String },

    /// The wrapped operation failed on its own terms.
    #[error(transparent)]
    Inner(E),
}

impl<E> PolicyError<E> {
    /// True for [`PolicyError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True for [`PolicyError::CircuitOpen`].
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// True for [`PolicyError::BulkheadFull`].
    pub fn is_bulkhead_full(&self) -> bool {
        matches!(self, Self::BulkheadFull { .. })
    }

    /// True for [`PolicyError::RetriesExhausted`].
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// True for [`PolicyError::UnknownPolicy`].
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownPolicy { .. })
    }

    /// Borrow the transport error, whether it came straight through or was
    /// the last failure of an exhausted retry run.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Consume the error and extract the `Inner` value, if that is what it is.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Attempt count and final failure for an exhausted retry run.
    pub fn retries_exhausted_info(&self) -> Option<(usize, &E)> {
        match self {
            Self::RetriesExhausted { attempts, last } => Some((*attempts, last)),
            _ => None,
        }
    }

    /// Remaining break time if the circuit is open.
    pub fn circuit_retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
