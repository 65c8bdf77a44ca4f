//! Jitter strategies that randomize backoff delays.
//!
//! Concurrent callers retrying against the same endpoint with identical
//! backoff schedules wake up together; jitter spreads them out.
//!
//! - [`Jitter::None`]: deterministic delays, for tests.
//! - [`Jitter::Full`]: uniform in `[0, delay]`, replaces the delay entirely.
//! - [`Jitter::Additive`]: uniform in `[0, cap)` added on top of the delay;
//!   pairs with exponential backoff to give the classic `2^n + [0, 1s)`
//!   shape.

use rand::{rng, Rng};
use std::time::Duration;

/// Randomization applied to each computed backoff delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Jitter {
    /// Use the delay as-is.
    None,
    /// Replace the delay with a uniform draw from `[0, delay]`.
    Full,
    /// Add a uniform draw from `[0, cap)` to the delay.
    Additive(Duration),
}

impl Jitter {
    /// Full jitter.
    pub fn full() -> Self {
        Jitter::Full
    }

    /// Additive jitter with the given cap (exclusive).
    pub fn additive(cap: Duration) -> Self {
        Jitter::Additive(cap)
    }

    /// Randomize `delay` with the thread-local RNG.
    pub fn apply(&self, delay: Duration) -> Duration {
        self.apply_with_rng(delay, &mut rng())
    }

    /// Randomize `delay` with a caller-supplied RNG (deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full => {
                let millis = saturated_millis(delay);
                if millis == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.random_range(0..=millis))
            }
            Jitter::Additive(cap) => {
                let cap_millis = saturated_millis(*cap);
                if cap_millis == 0 {
                    return delay;
                }
                // Half-open range: the extra never reaches the cap.
                delay + Duration::from_millis(rng.random_range(0..cap_millis))
            }
        }
    }
}

fn saturated_millis(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
