//! Bulkhead: cap concurrent executions so one slow dependency cannot drain
//! the whole connection pool.
//!
//! Up to `max_concurrent` operations run at once. What happens to the
//! overflow is configurable: rejected immediately (the default), queued up to
//! a bound, or queued without bound. [`Bulkhead::unbounded`] is a pass-through
//! gate used to demonstrate the contrast when isolation is switched off.

use crate::PolicyError;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

/// Invalid bulkhead configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BulkheadConfigError {
    #[error("max_concurrent must be > 0")]
    ZeroConcurrency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueLimit {
    Bounded(usize),
    Unbounded,
}

struct Shared {
    /// `None` means the gate is a pass-through.
    slots: Option<Semaphore>,
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

type RejectCallback = dyn Fn(usize) + Send + Sync;

/// Concurrency-limiting policy. Clones share the same capacity.
#[derive(Clone)]
pub struct Bulkhead {
    shared: Arc<Shared>,
    max_concurrent: Option<usize>,
    queue: QueueLimit,
    on_rejected: Option<Arc<RejectCallback>>,
}

impl std::fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_concurrent", &self.max_concurrent)
            .field("queue", &self.queue)
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    /// Bulkhead with `max_concurrent` execution slots; overflow is rejected
    /// immediately.
    pub fn new(max_concurrent: usize) -> Result<Self, BulkheadConfigError> {
        if max_concurrent == 0 {
            return Err(BulkheadConfigError::ZeroConcurrency);
        }
        Ok(Self {
            shared: Arc::new(Shared {
                slots: Some(Semaphore::new(max_concurrent)),
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
            max_concurrent: Some(max_concurrent),
            queue: QueueLimit::Bounded(0),
            on_rejected: None,
        })
    }

    /// Queue up to `max_queue` overflow calls instead of rejecting them.
    pub fn with_queue(mut self, max_queue: usize) -> Self {
        self.queue = QueueLimit::Bounded(max_queue);
        self
    }

    /// Queue overflow without bound; this gate never rejects.
    pub fn with_unbounded_queue(mut self) -> Self {
        self.queue = QueueLimit::Unbounded;
        self
    }

    /// Pass-through gate: no concurrency limit at all, in-flight still
    /// tracked.
    pub fn unbounded() -> Self {
        Self {
            shared: Arc::new(Shared {
                slots: None,
                queued: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
            max_concurrent: None,
            queue: QueueLimit::Unbounded,
            on_rejected: None,
        }
    }

    /// Notification fired with the in-flight count when a call is rejected.
    /// Observability only.
    pub fn on_rejected<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.on_rejected = Some(Arc::new(callback));
        self
    }

    /// Operations currently executing (not queued).
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Execution slot count; `None` for a pass-through gate.
    pub fn max_concurrent(&self) -> Option<usize> {
        self.max_concurrent
    }

    /// Execute `operation` inside the bulkhead, queueing for a slot if the
    /// queue has room and rejecting otherwise.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, PolicyError<E>>
    where
        T: Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, PolicyError<E>>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        struct Queued<'a>(&'a Shared);
        impl Drop for Queued<'_> {
            fn drop(&mut self) {
                self.0.queued.fetch_sub(1, Ordering::Release);
            }
        }

        let permit = match (&self.shared.slots, self.max_concurrent) {
            (Some(slots), Some(max)) => match slots.try_acquire() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    // No free slot; take a queue place if one is left.
                    let waiting = self.shared.queued.fetch_add(1, Ordering::AcqRel);
                    let full = match self.queue {
                        QueueLimit::Bounded(limit) => waiting >= limit,
                        QueueLimit::Unbounded => false,
                    };
                    if full {
                        self.shared.queued.fetch_sub(1, Ordering::Release);
                        return Err(self.reject(max));
                    }
                    let _queued = Queued(&self.shared);
                    match slots.acquire().await {
                        Ok(permit) => Some(permit),
                        // The semaphore is never closed; saturate if it is.
                        Err(_) => return Err(self.reject(max)),
                    }
                }
            },
            _ => None,
        };

        struct InFlight<'a>(&'a Shared);
        impl Drop for InFlight<'_> {
            fn drop(&mut self) {
                self.0.in_flight.fetch_sub(1, Ordering::Release);
            }
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let _running = InFlight(&self.shared);

        let result = operation().await;
        drop(permit);
        result
    }

    fn reject<E>(&self, max: usize) -> PolicyError<E> {
        let in_flight = self.in_flight();
        tracing::warn!(in_flight, max, "bulkhead rejected call");
        if let Some(cb) = &self.on_rejected {
            cb(in_flight);
        }
        PolicyError::BulkheadFull { in_flight, max }
    }
}
