//! Named policy registry, built once and immutable afterwards.
//!
//! Call sites look policies up by name instead of constructing them inline,
//! so the whole resilience configuration lives in one place. The registry is
//! sealed at build time; there is deliberately no way to add or replace a
//! policy on a live registry.
//!
//! [`PolicyKind`] is the composition layer: each variant wraps one concrete
//! policy, and [`PolicyKind::wrap`] nests two kinds so e.g. a fallback can
//! guard a retry that guards a breaker. Execution recurses outermost-in.

use crate::{
    Bulkhead, CachePolicy, CallContext, CircuitBreaker, FallbackPolicy, PolicyError, RetryPolicy,
    TimeoutPolicy,
};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// An operation shaped for registry execution: shareable, re-invocable (for
/// retries), producing an owned future per call.
pub type SharedOp<T, E> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<T, PolicyError<E>>> + Send + Sync>;

/// Invalid registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryConfigError {
    /// Each name maps to exactly one policy.
    #[error("policy {name:?} registered twice")]
    DuplicateName { name: String },
}

/// One registrable policy, possibly a nested composition.
pub enum PolicyKind<T, E> {
    Retry(RetryPolicy<E>),
    CircuitBreaker(CircuitBreaker),
    Timeout(TimeoutPolicy),
    Fallback(FallbackPolicy<T, E>),
    Cache(CachePolicy<T>),
    Bulkhead(Bulkhead),
    /// Executes the operation unmodified. Useful as the innermost layer of a
    /// [`wrap`](Self::wrap) when only the outer policy matters.
    NoOp,
    /// `outer` observes every outcome of `inner`.
    Wrap { outer: Arc<PolicyKind<T, E>>, inner: Arc<PolicyKind<T, E>> },
}

impl<T, E> std::fmt::Debug for PolicyKind<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyKind::Retry(p) => p.fmt(f),
            PolicyKind::CircuitBreaker(p) => p.fmt(f),
            PolicyKind::Timeout(p) => p.fmt(f),
            PolicyKind::Fallback(p) => p.fmt(f),
            PolicyKind::Cache(p) => p.fmt(f),
            PolicyKind::Bulkhead(p) => p.fmt(f),
            PolicyKind::NoOp => f.write_str("NoOp"),
            PolicyKind::Wrap { outer, inner } => {
                f.debug_struct("Wrap").field("outer", outer).field("inner", inner).finish()
            }
        }
    }
}

impl<T, E> PolicyKind<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Nest `inner` inside `outer`.
    pub fn wrap(outer: PolicyKind<T, E>, inner: PolicyKind<T, E>) -> Self {
        PolicyKind::Wrap { outer: Arc::new(outer), inner: Arc::new(inner) }
    }

    /// Execute `operation` under this policy (and everything it wraps).
    ///
    /// Boxed because `Wrap` recurses. Operations run under a registry-held
    /// timeout cannot see its cancellation token, so registries should use
    /// preemptive timeouts unless every operation is known to finish
    /// promptly.
    pub fn execute(
        self: Arc<Self>,
        ctx: CallContext,
        operation: SharedOp<T, E>,
    ) -> BoxFuture<'static, Result<T, PolicyError<E>>> {
        match &*self {
            PolicyKind::Retry(policy) => {
                let policy = policy.clone();
                Box::pin(async move { policy.execute_in(&ctx, move || (operation)()).await })
            }
            PolicyKind::CircuitBreaker(breaker) => {
                let breaker = breaker.clone();
                Box::pin(async move { breaker.execute(move || (operation)()).await })
            }
            PolicyKind::Timeout(policy) => {
                let policy = policy.clone();
                Box::pin(async move { policy.execute(move |_token| (operation)()).await })
            }
            PolicyKind::Fallback(policy) => {
                let policy = policy.clone();
                Box::pin(async move { policy.execute_in(&ctx, move || (operation)()).await })
            }
            PolicyKind::Cache(policy) => {
                let policy = policy.clone();
                Box::pin(async move { policy.execute_in(&ctx, move || (operation)()).await })
            }
            PolicyKind::Bulkhead(bulkhead) => {
                let bulkhead = bulkhead.clone();
                Box::pin(async move { bulkhead.execute(move || (operation)()).await })
            }
            PolicyKind::NoOp => Box::pin(async move { (operation)().await }),
            PolicyKind::Wrap { outer, inner } => {
                let outer = outer.clone();
                let inner = inner.clone();
                let inner_ctx = ctx.clone();
                let inner_op: SharedOp<T, E> = Arc::new(move || {
                    inner.clone().execute(inner_ctx.clone(), operation.clone())
                });
                outer.execute(ctx, inner_op)
            }
        }
    }
}

/// Builder for [`PolicyRegistry`]. Rejects duplicate names at registration.
pub struct PolicyRegistryBuilder<T, E> {
    policies: HashMap<String, Arc<PolicyKind<T, E>>>,
}

impl<T, E> PolicyRegistryBuilder<T, E> {
    pub fn new() -> Self {
        Self { policies: HashMap::new() }
    }

    /// Register a policy under `name`.
    pub fn register(
        mut self,
        name: impl Into<String>,
        policy: PolicyKind<T, E>,
    ) -> Result<Self, RegistryConfigError> {
        let name = name.into();
        if self.policies.contains_key(&name) {
            return Err(RegistryConfigError::DuplicateName { name });
        }
        self.policies.insert(name, Arc::new(policy));
        Ok(self)
    }

    /// Seal the registry.
    pub fn build(self) -> PolicyRegistry<T, E> {
        tracing::info!(policies = self.policies.len(), "policy registry sealed");
        PolicyRegistry { policies: Arc::new(self.policies) }
    }
}

impl<T, E> Default for PolicyRegistryBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for PolicyRegistryBuilder<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistryBuilder")
            .field("policies", &self.policies.len())
            .finish_non_exhaustive()
    }
}

/// Immutable name-to-policy map. Cheap to clone; clones share the same map.
pub struct PolicyRegistry<T, E> {
    policies: Arc<HashMap<String, Arc<PolicyKind<T, E>>>>,
}

impl<T, E> Clone for PolicyRegistry<T, E> {
    fn clone(&self) -> Self {
        Self { policies: self.policies.clone() }
    }
}

impl<T, E> std::fmt::Debug for PolicyRegistry<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRegistry").field("policies", &self.policies.len()).finish()
    }
}

impl<T, E> PolicyRegistry<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    pub fn builder() -> PolicyRegistryBuilder<T, E> {
        PolicyRegistryBuilder::new()
    }

    /// Look a policy up by name.
    pub fn get(&self, name: &str) -> Option<Arc<PolicyKind<T, E>>> {
        self.policies.get(name).cloned()
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Execute `operation` under the policy registered as `name`.
    ///
    /// An unknown name is a configuration error: the call fails immediately
    /// with [`PolicyError::UnknownPolicy`] and the operation is not invoked.
    pub async fn execute(
        &self,
        name: &str,
        ctx: CallContext,
        operation: SharedOp<T, E>,
    ) -> Result<T, PolicyError<E>> {
        let Some(policy) = self.get(name) else {
            tracing::error!(name, "lookup of unregistered policy");
            return Err(PolicyError::UnknownPolicy { name: name.to_string() });
        };
        policy.execute(ctx, operation).await
    }
}
