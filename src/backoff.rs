//! Backoff strategies that generate the delay before each retry.
//!
//! Retry attempt indices are 1-based here: `delay(1)` is the wait before the
//! first retry. `delay` returns `None` when the strategy has nothing left to
//! offer — a [`Backoff::sequence`] that has been walked to the end stops the
//! retry loop even if the attempt budget is not spent.
//!
//! Computed delays saturate at [`MAX_BACKOFF`] instead of overflowing.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Ceiling applied when a computed delay would overflow (one day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Invalid backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// `with_max` only applies to the exponential strategy.
    #[error("with_max is only valid for exponential backoff")]
    MaxNotSupported,
    /// The cap must be positive and at least the base delay.
    #[error("max ({max:?}) must be positive and >= base ({base:?})")]
    InvalidMax { base: Duration, max: Duration },
    /// A delay sequence must contain at least one entry.
    #[error("delay sequence must not be empty")]
    EmptySequence,
}

#[derive(Clone, PartialEq, Eq)]
enum Strategy {
    /// Fixed ordered delays, one per retry; exhaustion ends retrying.
    Sequence(Vec<Duration>),
    /// Same delay before every retry.
    Constant(Duration),
    /// `base * 2^(n-1)` for retry `n`, optionally capped.
    Exponential { base: Duration, max: Option<Duration> },
}

/// Delay generator for a retry policy.
#[derive(Clone, PartialEq, Eq)]
pub struct Backoff {
    strategy: Strategy,
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.strategy {
            Strategy::Sequence(delays) => {
                f.debug_tuple("Backoff::Sequence").field(delays).finish()
            }
            Strategy::Constant(delay) => f.debug_tuple("Backoff::Constant").field(delay).finish(),
            Strategy::Exponential { base, max } => f
                .debug_struct("Backoff::Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
        }
    }
}

impl Backoff {
    /// Predetermined delays, one per retry (e.g. `[3s, 5s]` retries twice and
    /// then gives up).
    pub fn sequence(delays: Vec<Duration>) -> Result<Self, BackoffError> {
        if delays.is_empty() {
            return Err(BackoffError::EmptySequence);
        }
        Ok(Self { strategy: Strategy::Sequence(delays) })
    }

    /// The same delay before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { strategy: Strategy::Constant(delay) }
    }

    /// Exponential doubling from `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { strategy: Strategy::Exponential { base, max: None } }
    }

    /// Cap exponential growth. Errors on non-exponential strategies and on
    /// caps below the base.
    pub fn with_max(mut self, cap: Duration) -> Result<Self, BackoffError> {
        match &mut self.strategy {
            Strategy::Exponential { base, max } => {
                if cap.is_zero() || cap < *base {
                    return Err(BackoffError::InvalidMax { base: *base, max: cap });
                }
                *max = Some(cap);
                Ok(self)
            }
            _ => Err(BackoffError::MaxNotSupported),
        }
    }

    /// Delay before retry `attempt` (1-based). `None` means no further
    /// retries are permitted by this strategy.
    pub fn delay(&self, attempt: usize) -> Option<Duration> {
        if attempt == 0 {
            // Attempt 0 is the initial call; it never waits.
            return Some(Duration::ZERO);
        }
        match &self.strategy {
            Strategy::Sequence(delays) => delays.get(attempt - 1).copied(),
            Strategy::Constant(delay) => Some(*delay),
            Strategy::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let raw = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                let capped = max.map_or(raw, |m| raw.min(m));
                Some(capped.min(MAX_BACKOFF))
            }
        }
    }

    /// Number of retries this strategy can produce, if bounded.
    pub fn retry_bound(&self) -> Option<usize> {
        match &self.strategy {
            Strategy::Sequence(delays) => Some(delays.len()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_walks_in_order_then_stops() {
        let backoff =
            Backoff::sequence(vec![Duration::from_secs(3), Duration::from_secs(5)]).unwrap();
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(3)));
        assert_eq!(backoff.delay(2), Some(Duration::from_secs(5)));
        assert_eq!(backoff.delay(3), None);
        assert_eq!(backoff.retry_bound(), Some(2));
    }

    #[test]
    fn empty_sequence_is_rejected() {
        assert_eq!(Backoff::sequence(vec![]).unwrap_err(), BackoffError::EmptySequence);
    }

    #[test]
    fn constant_never_runs_out() {
        let backoff = Backoff::constant(Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(500), Some(Duration::from_millis(100)));
        assert_eq!(backoff.retry_bound(), None);
    }

    #[test]
    fn exponential_doubles_per_retry() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(backoff.delay(3), Some(Duration::from_secs(4)));
        assert_eq!(backoff.delay(4), Some(Duration::from_secs(8)));
    }

    #[test]
    fn exponential_respects_cap() {
        let backoff = Backoff::exponential(Duration::from_millis(100))
            .with_max(Duration::from_secs(1))
            .unwrap();
        assert_eq!(backoff.delay(1), Some(Duration::from_millis(100)));
        assert_eq!(backoff.delay(4), Some(Duration::from_millis(800)));
        assert_eq!(backoff.delay(5), Some(Duration::from_secs(1)));
        assert_eq!(backoff.delay(20), Some(Duration::from_secs(1)));
    }

    #[test]
    fn exponential_saturates_instead_of_overflowing() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(1_000_000_000), Some(MAX_BACKOFF));
        assert_eq!(backoff.delay((u32::MAX as usize) + 10), Some(MAX_BACKOFF));
    }

    #[test]
    fn cap_below_base_is_rejected() {
        let err = Backoff::exponential(Duration::from_secs(10))
            .with_max(Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BackoffError::InvalidMax { .. }));
    }

    #[test]
    fn cap_on_constant_is_rejected() {
        let err =
            Backoff::constant(Duration::from_secs(1)).with_max(Duration::from_secs(2)).unwrap_err();
        assert_eq!(err, BackoffError::MaxNotSupported);
    }

    #[test]
    fn attempt_zero_is_the_initial_call() {
        let backoff = Backoff::exponential(Duration::from_secs(1));
        assert_eq!(backoff.delay(0), Some(Duration::ZERO));
    }
}
