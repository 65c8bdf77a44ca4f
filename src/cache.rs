//! Cache-aside policy: serve a previously fetched value instead of calling
//! again.
//!
//! Keyed by the operation key on the [`CallContext`]. A hit within the TTL
//! returns the stored value without invoking the operation; a miss (including
//! an expired entry) invokes and stores the result on success. Failures of
//! the wrapped operation are never cached.
//!
//! The store itself may fail — a [`CacheAccessError`] is always swallowed:
//! a failed lookup degrades to a miss and a failed put loses the entry, but
//! the wrapped call's outcome is unaffected either way.

use crate::{CallContext, Clock, MonotonicClock, PolicyError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Failure of the cache store itself. Never propagated to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cache access failed: {reason}")]
pub struct CacheAccessError {
    reason: String,
}

impl CacheAccessError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Invalid cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheConfigError {
    #[error("cache ttl must be > 0")]
    ZeroTtl,
}

/// Keyed value store behind the cache policy. Expiry is the store's concern;
/// `get` must not return entries past their TTL.
pub trait CacheStore<T>: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<T>, CacheAccessError>;
    fn put(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheAccessError>;
    fn remove(&self, key: &str) -> Result<(), CacheAccessError>;
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at_millis: u64,
}

/// In-memory TTL store against an injectable [`Clock`].
pub struct InMemoryStore<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T> InMemoryStore<T> {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::default())
    }

    /// Store with an explicit time source (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(clock: C) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock: Arc::new(clock) }
    }
}

impl<T> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for InMemoryStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl<T: Clone + Send> CacheStore<T> for InMemoryStore<T> {
    fn get(&self, key: &str) -> Result<Option<T>, CacheAccessError> {
        let now = self.clock.now_millis();
        let mut entries =
            self.entries.lock().map_err(|_| CacheAccessError::new("store lock poisoned"))?;
        match entries.get(key) {
            Some(entry) if entry.expires_at_millis > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                // Expired; drop it so the map does not accumulate stale
                // entries.
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: T, ttl: Duration) -> Result<(), CacheAccessError> {
        let ttl_millis: u64 = ttl.as_millis().try_into().unwrap_or(u64::MAX);
        let expires_at_millis = self.clock.now_millis().saturating_add(ttl_millis);
        self.entries
            .lock()
            .map_err(|_| CacheAccessError::new("store lock poisoned"))?
            .insert(key.to_string(), Entry { value, expires_at_millis });
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheAccessError> {
        self.entries
            .lock()
            .map_err(|_| CacheAccessError::new("store lock poisoned"))?
            .remove(key);
        Ok(())
    }
}

type KeyCallback = dyn Fn(&str) + Send + Sync;
type AccessErrorCallback = dyn Fn(&CacheAccessError) + Send + Sync;

/// Cache policy holding values of one type for a fixed TTL.
///
/// Calls with an empty context key bypass the cache entirely; there is
/// nothing sound to key them on.
pub struct CachePolicy<T> {
    ttl: Duration,
    store: Arc<dyn CacheStore<T>>,
    on_hit: Option<Arc<KeyCallback>>,
    on_miss: Option<Arc<KeyCallback>>,
    on_put: Option<Arc<KeyCallback>>,
    on_get_error: Option<Arc<AccessErrorCallback>>,
    on_put_error: Option<Arc<AccessErrorCallback>>,
}

impl<T> Clone for CachePolicy<T> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            store: self.store.clone(),
            on_hit: self.on_hit.clone(),
            on_miss: self.on_miss.clone(),
            on_put: self.on_put.clone(),
            on_get_error: self.on_get_error.clone(),
            on_put_error: self.on_put_error.clone(),
        }
    }
}

impl<T> std::fmt::Debug for CachePolicy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy").field("ttl", &self.ttl).finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> CachePolicy<T> {
    /// In-memory cache with the given time-to-live.
    pub fn new(ttl: Duration) -> Result<Self, CacheConfigError> {
        Self::with_store(ttl, Arc::new(InMemoryStore::new()))
    }

    /// Cache backed by a caller-supplied store.
    pub fn with_store(
        ttl: Duration,
        store: Arc<dyn CacheStore<T>>,
    ) -> Result<Self, CacheConfigError> {
        if ttl.is_zero() {
            return Err(CacheConfigError::ZeroTtl);
        }
        Ok(Self {
            ttl,
            store,
            on_hit: None,
            on_miss: None,
            on_put: None,
            on_get_error: None,
            on_put_error: None,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Notification fired with the key on a cache hit.
    pub fn on_hit<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_hit = Some(Arc::new(callback));
        self
    }

    /// Notification fired with the key on a miss, before the operation runs.
    pub fn on_miss<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_miss = Some(Arc::new(callback));
        self
    }

    /// Notification fired with the key after a value is stored.
    pub fn on_put<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_put = Some(Arc::new(callback));
        self
    }

    /// Notification fired when a lookup fails; the call proceeds as a miss.
    pub fn on_get_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CacheAccessError) + Send + Sync + 'static,
    {
        self.on_get_error = Some(Arc::new(callback));
        self
    }

    /// Notification fired when a store fails; the call still succeeds.
    pub fn on_put_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&CacheAccessError) + Send + Sync + 'static,
    {
        self.on_put_error = Some(Arc::new(callback));
        self
    }

    /// Drop one entry. Store failures are swallowed here too.
    pub fn invalidate(&self, key: &str) {
        if let Err(error) = self.store.remove(key) {
            tracing::warn!(key, %error, "cache invalidation failed");
        }
    }

    /// Serve from cache or invoke `operation` and store its success.
    pub async fn execute_in<E, Fut, Op>(
        &self,
        context: &CallContext,
        operation: Op,
    ) -> Result<T, PolicyError<E>>
    where
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let key = context.key();
        if key.is_empty() {
            return operation().await;
        }

        match self.store.get(key) {
            Ok(Some(value)) => {
                tracing::debug!(key, "cache hit");
                if let Some(cb) = &self.on_hit {
                    cb(key);
                }
                return Ok(value);
            }
            Ok(None) => {
                tracing::debug!(key, "cache miss");
                if let Some(cb) = &self.on_miss {
                    cb(key);
                }
            }
            Err(error) => {
                // Degrades to a miss; the operation is still attempted.
                tracing::warn!(key, %error, "cache lookup failed");
                if let Some(cb) = &self.on_get_error {
                    cb(&error);
                }
            }
        }

        let value = operation().await?;
        match self.store.put(key, value.clone(), self.ttl) {
            Ok(()) => {
                if let Some(cb) = &self.on_put {
                    cb(key);
                }
            }
            Err(error) => {
                tracing::warn!(key, %error, "cache store failed");
                if let Some(cb) = &self.on_put_error {
                    cb(&error);
                }
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    /// Store whose every access fails.
    struct BrokenStore;

    impl CacheStore<String> for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, CacheAccessError> {
            Err(CacheAccessError::new("backend offline"))
        }

        fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheAccessError> {
            Err(CacheAccessError::new("backend offline"))
        }

        fn remove(&self, _key: &str) -> Result<(), CacheAccessError> {
            Err(CacheAccessError::new("backend offline"))
        }
    }

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<String, PolicyError<TestError>>>
    {
        move || {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(format!("fetch {n}"))
            })
        }
    }

    #[test]
    fn zero_ttl_is_rejected() {
        assert_eq!(
            CachePolicy::<String>::new(Duration::ZERO).unwrap_err(),
            CacheConfigError::ZeroTtl
        );
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let cache = CachePolicy::new(Duration::from_secs(60)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::new("myCachedValue");

        let first = cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        let second = cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();

        assert_eq!(first, "fetch 0");
        assert_eq!(second, "fetch 0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let clock = ManualClock::new();
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let cache = CachePolicy::with_store(Duration::from_secs(10), store).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::new("k");

        assert_eq!(cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap(), "fetch 0");

        clock.advance_millis(9_999);
        assert_eq!(cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap(), "fetch 0");

        clock.advance_millis(1);
        assert_eq!(cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap(), "fetch 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache: CachePolicy<String> = CachePolicy::new(Duration::from_secs(60)).unwrap();
        let ctx = CallContext::new("k");

        let err = cache
            .execute_in(&ctx, || async { Err(PolicyError::Inner(TestError("boom"))) })
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::Inner(_)));

        // Next call still invokes the operation.
        let out: Result<String, PolicyError<TestError>> =
            cache.execute_in(&ctx, || async { Ok("recovered".to_string()) }).await;
        assert_eq!(out.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let cache = CachePolicy::new(Duration::from_secs(60)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let a = cache.execute_in(&CallContext::new("a"), counting_fetch(calls.clone())).await.unwrap();
        let b = cache.execute_in(&CallContext::new("b"), counting_fetch(calls.clone())).await.unwrap();

        assert_ne!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_key_bypasses_the_cache() {
        let cache = CachePolicy::new(Duration::from_secs(60)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::default();

        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_refetch() {
        let cache = CachePolicy::new(Duration::from_secs(60)).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::new("k");

        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        cache.invalidate("k");
        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn hit_miss_and_put_callbacks_fire() {
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        let puts = Arc::new(AtomicUsize::new(0));
        let (hits_cb, misses_cb, puts_cb) = (hits.clone(), misses.clone(), puts.clone());

        let cache = CachePolicy::new(Duration::from_secs(60))
            .unwrap()
            .on_hit(move |key| {
                assert_eq!(key, "k");
                hits_cb.fetch_add(1, Ordering::SeqCst);
            })
            .on_miss(move |_| {
                misses_cb.fetch_add(1, Ordering::SeqCst);
            })
            .on_put(move |_| {
                puts_cb.fetch_add(1, Ordering::SeqCst);
            });

        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::new("k");
        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();

        assert_eq!(misses.load(Ordering::SeqCst), 1);
        assert_eq!(puts.load(Ordering::SeqCst), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_store_degrades_to_a_miss() {
        let get_errors = Arc::new(AtomicUsize::new(0));
        let put_errors = Arc::new(AtomicUsize::new(0));
        let (get_cb, put_cb) = (get_errors.clone(), put_errors.clone());

        let cache = CachePolicy::with_store(Duration::from_secs(60), Arc::new(BrokenStore))
            .unwrap()
            .on_get_error(move |_| {
                get_cb.fetch_add(1, Ordering::SeqCst);
            })
            .on_put_error(move |_| {
                put_cb.fetch_add(1, Ordering::SeqCst);
            });

        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CallContext::new("k");

        // The call succeeds despite the store failing on both sides.
        let out = cache.execute_in(&ctx, counting_fetch(calls.clone())).await.unwrap();
        assert_eq!(out, "fetch 0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(get_errors.load(Ordering::SeqCst), 1);
        assert_eq!(put_errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_memory_store_round_trips() {
        let store: InMemoryStore<String> = InMemoryStore::new();
        assert_eq!(store.get("k").unwrap(), None);

        store.put("k", "v".to_string(), Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));

        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }
}
