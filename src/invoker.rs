//! Endpoint invoker: the seam between the policy registry and the transport.
//!
//! Call sites name a policy and a path; the invoker looks the policy up,
//! shapes the transport call into a re-invocable operation, and runs it under
//! the policy. Transport failures surface as [`PolicyError::Inner`] so the
//! retry predicate can classify them.

use crate::{
    Backoff, BackoffError, Bulkhead, BulkheadConfigError, CachePolicy, CacheConfigError,
    CallContext, CircuitBreaker, CircuitConfigError, FallbackPolicy, Jitter, PolicyError,
    PolicyKind, PolicyRegistry, RegistryConfigError, RetryConfigError, RetryPolicy,
    SimulatedService, TimeoutConfigError, TimeoutPolicy, Transport, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Body served when the fallback policy absorbs a failure.
pub const FALLBACK_BODY: &str = "Please try again later [Fallback for any exception]";

/// Any invalid policy configuration, aggregated for wiring code that builds
/// several policies at once.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Retry(#[from] RetryConfigError),
    #[error(transparent)]
    Backoff(#[from] BackoffError),
    #[error(transparent)]
    Circuit(#[from] CircuitConfigError),
    #[error(transparent)]
    Timeout(#[from] TimeoutConfigError),
    #[error(transparent)]
    Cache(#[from] CacheConfigError),
    #[error(transparent)]
    Bulkhead(#[from] BulkheadConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryConfigError),
    #[error(transparent)]
    Dispatcher(#[from] crate::DispatcherConfigError),
}

/// Invokes paths on one endpoint through registry-held policies.
#[derive(Clone)]
pub struct EndpointInvoker {
    transport: Arc<dyn Transport>,
    registry: PolicyRegistry<String, TransportError>,
    endpoint: String,
}

impl std::fmt::Debug for EndpointInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointInvoker")
            .field("endpoint", &self.endpoint)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl EndpointInvoker {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: PolicyRegistry<String, TransportError>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self { transport, registry, endpoint: endpoint.into() }
    }

    /// Invoker wired to the simulated demo service with one policy per demo
    /// route.
    pub fn demo() -> Result<Self, ConfigError> {
        Ok(Self::new(Arc::new(SimulatedService::demo()), demo_registry()?, "dataapi"))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn registry(&self) -> &PolicyRegistry<String, TransportError> {
        &self.registry
    }

    /// Invoke `path` directly, with no policy in front of the transport.
    /// The unprotected baseline the policies are contrasted against.
    pub async fn call(&self, path: &str) -> Result<String, TransportError> {
        match self.transport.invoke(&self.endpoint, path).await {
            Ok(body) => {
                tracing::debug!(endpoint = %self.endpoint, path, "direct call succeeded");
                Ok(body)
            }
            Err(error) => {
                tracing::warn!(endpoint = %self.endpoint, path, %error, "direct call failed");
                Err(error)
            }
        }
    }

    /// Invoke `path` under the policy registered as `policy`, keying the call
    /// context on the path. An unregistered policy name fails the call with
    /// [`PolicyError::UnknownPolicy`] without touching the transport.
    pub async fn invoke(
        &self,
        policy: &str,
        path: &str,
    ) -> Result<String, PolicyError<TransportError>> {
        self.invoke_in(policy, path, CallContext::new(path)).await
    }

    /// [`invoke`](Self::invoke) with a caller-supplied context (custom cache
    /// keys, observability bag values).
    pub async fn invoke_in(
        &self,
        policy: &str,
        path: &str,
        ctx: CallContext,
    ) -> Result<String, PolicyError<TransportError>> {
        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let path = path.to_string();
        tracing::debug!(policy, endpoint = %self.endpoint, path = %path, "invoking endpoint");

        self.registry
            .execute(
                policy,
                ctx,
                Arc::new(move || {
                    let transport = transport.clone();
                    let endpoint = endpoint.clone();
                    let path = path.clone();
                    Box::pin(async move {
                        transport.invoke(&endpoint, &path).await.map_err(PolicyError::Inner)
                    })
                }),
            )
            .await
    }
}

fn wait_and_retry() -> Result<RetryPolicy<TransportError>, ConfigError> {
    let policy = RetryPolicy::builder()
        .retry_forever()
        .backoff(Backoff::sequence(vec![Duration::from_secs(3), Duration::from_secs(5)])?)
        .jitter(Jitter::None)
        .retry_on(TransportError::is_transient)
        .build()?;
    Ok(policy)
}

/// The demo policy table, one entry per simulated route:
///
/// - `exponentialbackoff`: wait-and-retry with the fixed `[3s, 5s]` schedule.
/// - `jitter`: exponential `2^n` seconds plus up to a second of jitter, for
///   up to 5 attempts.
/// - `circuitbreaker`: opens after 2 consecutive failures for 30 seconds.
/// - `fallback`: canned body wrapped around the `[3s, 5s]` retry.
/// - `cache`: 30-second TTL keyed on the call context, over a pass-through.
/// - `timeout`: 5-second preemptive deadline.
/// - `bulkhead`: 4 concurrent slots with 4 queued.
pub fn demo_registry() -> Result<PolicyRegistry<String, TransportError>, ConfigError> {
    let jittered = RetryPolicy::builder()
        .max_attempts(5)
        .backoff(Backoff::exponential(Duration::from_secs(2)))
        .jitter(Jitter::additive(Duration::from_secs(1)))
        .retry_on(TransportError::is_transient)
        .build()?;

    let registry = PolicyRegistry::builder()
        .register("exponentialbackoff", PolicyKind::Retry(wait_and_retry()?))?
        .register("jitter", PolicyKind::Retry(jittered))?
        .register(
            "circuitbreaker",
            PolicyKind::CircuitBreaker(CircuitBreaker::new(2, Duration::from_secs(30))?),
        )?
        .register(
            "fallback",
            PolicyKind::wrap(
                PolicyKind::Fallback(FallbackPolicy::value(FALLBACK_BODY.to_string())),
                PolicyKind::Retry(wait_and_retry()?),
            ),
        )?
        .register(
            "cache",
            PolicyKind::wrap(
                PolicyKind::Cache(CachePolicy::new(Duration::from_secs(30))?),
                PolicyKind::NoOp,
            ),
        )?
        .register("timeout", PolicyKind::Timeout(TimeoutPolicy::preemptive(Duration::from_secs(5))?))?
        .register("bulkhead", PolicyKind::Bulkhead(Bulkhead::new(4)?.with_queue(4)))?
        .build();
    Ok(registry)
}
