//! Transport seam and the simulated remote service used by demos and tests.
//!
//! The policies never speak HTTP themselves; they wrap a [`Transport`] that
//! resolves to either a response body or a classified [`TransportError`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single transport call, classified so policies can decide
/// whether it is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connectivity-level failure: the request never produced a response.
    #[error("connection to {endpoint} failed: {reason}")]
    Network { endpoint: String, reason: String },
    /// The remote answered with a non-success status.
    #[error("{endpoint} returned status {status}")]
    Status { endpoint: String, status: u16 },
}

impl TransportError {
    /// Transient failures are worth retrying: connectivity loss and server
    /// errors. Client errors (4xx) are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network { .. } => true,
            TransportError::Status { status, .. } => *status >= 500,
        }
    }

    /// Status code, when the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            TransportError::Network { .. } => None,
        }
    }
}

/// One outbound call to a named endpoint. Implementations are expected to be
/// cheap to share behind an `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke(&self, endpoint: &str, path: &str) -> Result<String, TransportError>;
}

/// Canned behavior for one simulated route.
#[derive(Debug)]
pub enum Behavior {
    /// Succeed immediately with a fixed body.
    Succeed(String),
    /// Succeed with a fixed body after a delay.
    SucceedAfter { delay: Duration, body: String },
    /// Always answer with the given status.
    FailStatus(u16),
    /// Hold the connection for `delay`, then fail at the network level.
    NetworkFaultAfter { delay: Duration },
    /// Fail with a status while `remaining` is nonzero, then succeed with
    /// `body`.
    FailThenSucceed { status: u16, body: String, remaining: Mutex<u32> },
}

impl Behavior {
    /// Fail `failures` times with `status`, then succeed with `body`.
    pub fn fail_then_succeed(failures: u32, status: u16, body: impl Into<String>) -> Self {
        Behavior::FailThenSucceed { status, body: body.into(), remaining: Mutex::new(failures) }
    }
}

/// In-memory stand-in for the remote service: a routing table of fixed
/// behaviors. The policies only ever observe success, failure, and latency,
/// so this is all the "server" the crate needs.
#[derive(Debug, Default)]
pub struct SimulatedService {
    routes: HashMap<String, Behavior>,
}

impl SimulatedService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route, builder-style. Later registrations replace earlier
    /// ones.
    pub fn route(mut self, path: impl Into<String>, behavior: Behavior) -> Self {
        self.routes.insert(path.into(), behavior);
        self
    }

    /// The demo routing table: one route per policy exercise, matching the
    /// simulator endpoints the resilience layer is pointed at. The faulting
    /// bulkhead route ties up a connection for 3 seconds before failing.
    pub fn demo() -> Self {
        Self::new()
            .route("exponentialbackoff", Behavior::Succeed("Successful".into()))
            .route("circuitbreaker", Behavior::Succeed("Successful".into()))
            .route("circuitbreaker_aux", Behavior::Succeed("Successful".into()))
            .route("jitter", Behavior::Succeed("Successful".into()))
            .route("bulkhead", Behavior::Succeed("Successful".into()))
            .route(
                "faultingbulkhead",
                Behavior::NetworkFaultAfter { delay: Duration::from_secs(3) },
            )
            .route("fallback", Behavior::FailStatus(500))
            .route("cache", Behavior::Succeed("Successful".into()))
            .route(
                "timeout",
                Behavior::SucceedAfter {
                    delay: Duration::from_secs(10),
                    body: "Successful".into(),
                },
            )
    }
}

#[async_trait]
impl Transport for SimulatedService {
    async fn invoke(&self, endpoint: &str, path: &str) -> Result<String, TransportError> {
        let Some(behavior) = self.routes.get(path) else {
            return Err(TransportError::Status { endpoint: endpoint.to_string(), status: 404 });
        };
        match behavior {
            Behavior::Succeed(body) => Ok(body.clone()),
            Behavior::SucceedAfter { delay, body } => {
                tokio::time::sleep(*delay).await;
                Ok(body.clone())
            }
            Behavior::FailStatus(status) => {
                Err(TransportError::Status { endpoint: endpoint.to_string(), status: *status })
            }
            Behavior::NetworkFaultAfter { delay } => {
                tokio::time::sleep(*delay).await;
                Err(TransportError::Network {
                    endpoint: endpoint.to_string(),
                    reason: "connection reset".into(),
                })
            }
            Behavior::FailThenSucceed { status, body, remaining } => {
                let mut left = remaining.lock().expect("route counter poisoned");
                if *left > 0 {
                    *left -= 1;
                    Err(TransportError::Status {
                        endpoint: endpoint.to_string(),
                        status: *status,
                    })
                } else {
                    Ok(body.clone())
                }
            }
        }
    }
}
