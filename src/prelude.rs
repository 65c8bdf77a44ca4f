//! Convenient re-exports for common Ripcord types.
pub use crate::{
    backoff::{Backoff, BackoffError, MAX_BACKOFF},
    bulkhead::Bulkhead,
    cache::CachePolicy,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    context::CallContext,
    dispatcher::{BulkheadDispatcher, DispatchReport, DispatcherConfig},
    error::PolicyError,
    fallback::FallbackPolicy,
    invoker::EndpointInvoker,
    jitter::Jitter,
    registry::{PolicyKind, PolicyRegistry, PolicyRegistryBuilder},
    retry::{RetryPolicy, RetryPolicyBuilder},
    timeout::{TimeoutMode, TimeoutPolicy},
    transport::{Transport, TransportError},
};
