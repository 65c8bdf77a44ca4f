#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Ripcord
//!
//! Client-side resilience for calls to an unreliable service: composable
//! policies, a named policy registry, and a bulkhead load dispatcher.
//!
//! ## Features
//!
//! - **Retry policies** with backoff strategies (sequence, constant,
//!   exponential) and jitter
//! - **Circuit breakers** with half-open probe recovery, lock-free atomics
//! - **Timeouts** in cooperative and preemptive flavors
//! - **Fallbacks** substituting degraded answers for failures
//! - **TTL caching** keyed on the call context
//! - **Bulkheads** for concurrency isolation
//! - **Policy registry** built once, looked up by name at call sites
//! - **Bulkhead dispatcher** pacing mixed healthy/faulting load
//!
//! ## Quick Start
//!
//! ```rust
//! use ripcord::{Backoff, Jitter, PolicyError, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = RetryPolicy::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_secs(1)))
//!         .jitter(Jitter::full())
//!         .build()
//!         .unwrap();
//!
//!     let result = policy.execute(|| async {
//!         // Your async operation here
//!         Ok::<_, PolicyError<std::io::Error>>(())
//!     }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod bulkhead;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod fallback;
pub mod invoker;
pub mod jitter;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod timeout;
pub mod transport;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use bulkhead::{Bulkhead, BulkheadConfigError};
pub use cache::{CacheAccessError, CacheConfigError, CachePolicy, CacheStore, InMemoryStore};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitConfigError, CircuitState,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use context::CallContext;
pub use dispatcher::{
    BulkheadDispatcher, DispatchReport, DispatcherConfig, DispatcherConfigError, Lane, LaneStats,
};
pub use error::PolicyError;
pub use fallback::FallbackPolicy;
pub use invoker::{demo_registry, ConfigError, EndpointInvoker, FALLBACK_BODY};
pub use jitter::Jitter;
pub use registry::{
    PolicyKind, PolicyRegistry, PolicyRegistryBuilder, RegistryConfigError, SharedOp,
};
pub use retry::{RetryConfigError, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use timeout::{TimeoutConfigError, TimeoutMode, TimeoutPolicy};
pub use transport::{Behavior, SimulatedService, Transport, TransportError};
