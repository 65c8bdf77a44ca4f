//! Bulkhead dispatcher: paced concurrent load against a healthy and a
//! faulting route under one bounded scheduler.
//!
//! Every `pace` interval the dispatcher picks a lane at random and spawns one
//! call. All calls share a scheduler with `overall_capacity` execution slots;
//! the faulting route ties up a slot for seconds before failing, so left
//! alone it monopolizes the scheduler and the healthy lane's calls pile up
//! behind it. With `use_bulkhead` on, each lane first passes a compartment
//! admitting half the capacity, which caps how many scheduler slots the
//! faulting lane can hold and keeps the healthy lane answering throughout.
//!
//! The run stops when the caller's cancellation token fires or the grace
//! period elapses, whichever comes first. Both collapse into one internal
//! stop token that every pace wait and every in-flight call observes.
//!
//! Counters live in a single aggregator task fed over a channel; workers and
//! the generator only send events, so no count is ever written from two
//! places. A call cancelled mid-flight sends no completion event and is
//! reported as pending.

use crate::{Bulkhead, ConfigError, PolicyError, Transport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Which route a dispatched call targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Healthy,
    Faulting,
}

/// Counters for one lane. `pending` is derived, never stored: calls that
/// were cancelled before completing are exactly the difference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStats {
    pub requested: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl LaneStats {
    /// Requests dispatched but never resolved (cancelled mid-flight).
    pub fn pending(&self) -> u64 {
        let completed = self.succeeded + self.failed;
        debug_assert!(self.requested >= completed, "completions exceed requests");
        self.requested.saturating_sub(completed)
    }
}

/// Final tally of a dispatcher run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub healthy: LaneStats,
    pub faulting: LaneStats,
}

impl DispatchReport {
    pub fn total_requested(&self) -> u64 {
        self.healthy.requested + self.faulting.requested
    }

    pub fn total_pending(&self) -> u64 {
        self.healthy.pending() + self.faulting.pending()
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneStats {
        match lane {
            Lane::Healthy => &mut self.healthy,
            Lane::Faulting => &mut self.faulting,
        }
    }
}

/// Invalid dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatcherConfigError {
    #[error("pace must be > 0")]
    ZeroPace,
    #[error("grace period must be > 0")]
    ZeroGrace,
    #[error("overall capacity must be > 0")]
    ZeroCapacity,
    #[error("faulting_ratio must be within [0, 1], got {0}")]
    InvalidRatio(f64),
}

/// Dispatcher tuning. Defaults: one call every 100ms for 10 seconds, a
/// 50/50 lane split, 8 scheduler slots, and lane compartments of 4.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub pace: Duration,
    pub grace: Duration,
    pub faulting_ratio: f64,
    /// Execution slots shared by both lanes.
    pub overall_capacity: usize,
    /// Compartment size per lane when `use_bulkhead` is on.
    pub slots_per_lane: usize,
    /// Off turns both compartments into pass-throughs, leaving only the
    /// shared scheduler. The failure mode the compartments exist to prevent.
    pub use_bulkhead: bool,
    /// Fixed RNG seed for reproducible lane selection; `None` draws from the
    /// OS.
    pub seed: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(100),
            grace: Duration::from_secs(10),
            faulting_ratio: 0.5,
            overall_capacity: 8,
            slots_per_lane: 4,
            use_bulkhead: true,
            seed: None,
        }
    }
}

enum Event {
    Requested(Lane),
    Completed(Lane, bool),
}

/// Paced load generator running healthy and faulting calls through per-lane
/// compartments into a shared scheduler.
pub struct BulkheadDispatcher {
    transport: Arc<dyn Transport>,
    endpoint: String,
    healthy_path: String,
    faulting_path: String,
    healthy_compartment: Bulkhead,
    faulting_compartment: Bulkhead,
    scheduler: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl std::fmt::Debug for BulkheadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkheadDispatcher")
            .field("endpoint", &self.endpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BulkheadDispatcher {
    /// Dispatcher over `transport` with the demo route names.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_routes(transport, config, "dataapi", "bulkhead", "faultingbulkhead")
    }

    /// Dispatcher with explicit endpoint and route names.
    pub fn with_routes(
        transport: Arc<dyn Transport>,
        config: DispatcherConfig,
        endpoint: impl Into<String>,
        healthy_path: impl Into<String>,
        faulting_path: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        if config.pace.is_zero() {
            return Err(DispatcherConfigError::ZeroPace.into());
        }
        if config.grace.is_zero() {
            return Err(DispatcherConfigError::ZeroGrace.into());
        }
        if config.overall_capacity == 0 {
            return Err(DispatcherConfigError::ZeroCapacity.into());
        }
        if !(0.0..=1.0).contains(&config.faulting_ratio) {
            return Err(DispatcherConfigError::InvalidRatio(config.faulting_ratio).into());
        }
        // Compartment waiters queue without bound; the scheduler slot is
        // only taken once a call is admitted, so queued calls cost nothing.
        let compartment = || -> Result<Bulkhead, ConfigError> {
            if config.use_bulkhead {
                Ok(Bulkhead::new(config.slots_per_lane)?.with_unbounded_queue())
            } else {
                Ok(Bulkhead::unbounded())
            }
        };
        Ok(Self {
            transport,
            endpoint: endpoint.into(),
            healthy_path: healthy_path.into(),
            faulting_path: faulting_path.into(),
            healthy_compartment: compartment()?,
            faulting_compartment: compartment()?,
            scheduler: Arc::new(Semaphore::new(config.overall_capacity)),
            config,
        })
    }

    /// Run until `external` is cancelled or the grace period elapses.
    ///
    /// In-flight calls observe the stop signal at every wait (pace,
    /// compartment queue, scheduler, transport) and abandon without
    /// completing, so the report can show a nonzero pending count; nothing
    /// is double-counted.
    pub async fn run(&self, external: &CancellationToken) -> DispatchReport {
        let stop = external.child_token();

        let grace = self.config.grace;
        let grace_stop = stop.clone();
        let grace_timer = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    tracing::info!(?grace, "grace period elapsed, stopping dispatch");
                    grace_stop.cancel();
                }
                _ = grace_stop.cancelled() => {}
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let aggregator = tokio::spawn(aggregate(events_rx));

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut workers = JoinSet::new();
        tracing::info!(
            pace = ?self.config.pace,
            ?grace,
            ratio = self.config.faulting_ratio,
            compartments = self.config.use_bulkhead,
            "dispatch started"
        );

        while !stop.is_cancelled() {
            let lane = if rng.random_bool(self.config.faulting_ratio) {
                Lane::Faulting
            } else {
                Lane::Healthy
            };
            // Requested is counted here, before the call can be cancelled;
            // the completion event may never come.
            let _ = events_tx.send(Event::Requested(lane));
            workers.spawn(self.dispatch_one(lane, stop.clone(), events_tx.clone()));

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.pace) => {}
            }
        }

        drop(events_tx);
        while workers.join_next().await.is_some() {}
        stop.cancel();
        let _ = grace_timer.await;

        let report = aggregator.await.unwrap_or_default();
        tracing::info!(
            requested = report.total_requested(),
            healthy_ok = report.healthy.succeeded,
            faulting_failed = report.faulting.failed,
            pending = report.total_pending(),
            "dispatch finished"
        );
        report
    }

    fn dispatch_one(
        &self,
        lane: Lane,
        stop: CancellationToken,
        events: mpsc::UnboundedSender<Event>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let (compartment, path) = match lane {
            Lane::Healthy => (self.healthy_compartment.clone(), self.healthy_path.clone()),
            Lane::Faulting => (self.faulting_compartment.clone(), self.faulting_path.clone()),
        };
        let scheduler = self.scheduler.clone();
        let capacity = self.config.overall_capacity;
        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();

        async move {
            // Compartment admission first, scheduler slot second: a call
            // queued at its compartment holds no scheduler capacity.
            let call = compartment.execute(|| async {
                let _slot = scheduler
                    .acquire()
                    .await
                    // The scheduler is never closed.
                    .map_err(|_| PolicyError::BulkheadFull { in_flight: 0, max: capacity })?;
                transport.invoke(&endpoint, &path).await.map_err(PolicyError::Inner)
            });
            tokio::select! {
                // Cancelled calls report nothing; they stay pending.
                _ = stop.cancelled() => {}
                result = call => {
                    if let Err(error) = &result {
                        tracing::debug!(?lane, %error, "dispatched call failed");
                    }
                    let _ = events.send(Event::Completed(lane, result.is_ok()));
                }
            }
        }
    }
}

/// Single owner of the counters: consumes events until every sender is gone,
/// then yields the final report.
async fn aggregate(mut events: mpsc::UnboundedReceiver<Event>) -> DispatchReport {
    let mut report = DispatchReport::default();
    while let Some(event) = events.recv().await {
        match event {
            Event::Requested(lane) => report.lane_mut(lane).requested += 1,
            Event::Completed(lane, true) => report.lane_mut(lane).succeeded += 1,
            Event::Completed(lane, false) => report.lane_mut(lane).failed += 1,
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulatedService;

    fn demo_dispatcher(config: DispatcherConfig) -> BulkheadDispatcher {
        BulkheadDispatcher::new(Arc::new(SimulatedService::demo()), config)
            .expect("valid dispatcher config")
    }

    fn seeded(seed: u64) -> DispatcherConfig {
        DispatcherConfig { seed: Some(seed), ..DispatcherConfig::default() }
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let transport = Arc::new(SimulatedService::demo());
        let zero_pace = DispatcherConfig { pace: Duration::ZERO, ..Default::default() };
        assert!(BulkheadDispatcher::new(transport.clone(), zero_pace).is_err());

        let zero_grace = DispatcherConfig { grace: Duration::ZERO, ..Default::default() };
        assert!(BulkheadDispatcher::new(transport.clone(), zero_grace).is_err());

        let zero_capacity = DispatcherConfig { overall_capacity: 0, ..Default::default() };
        assert!(BulkheadDispatcher::new(transport.clone(), zero_capacity).is_err());

        let bad_ratio = DispatcherConfig { faulting_ratio: 1.5, ..Default::default() };
        assert!(BulkheadDispatcher::new(transport, bad_ratio).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_isolates_the_healthy_lane() {
        let dispatcher = demo_dispatcher(seeded(42));
        let external = CancellationToken::new();

        let report = dispatcher.run(&external).await;

        // One call per 100ms over a 10s grace window.
        assert!(report.total_requested() >= 90, "got {}", report.total_requested());
        assert!(report.total_requested() <= 101, "got {}", report.total_requested());

        // The healthy route answers instantly: nothing queues, nothing fails.
        assert_eq!(report.healthy.failed, 0);
        assert!(report.healthy.succeeded > 0);

        // The faulting route only ever produces network faults after 3s.
        assert_eq!(report.faulting.succeeded, 0);
        assert!(report.faulting.failed > 0);

        // Whatever was in flight at the stop stays pending, never negative.
        assert_eq!(
            report.total_requested(),
            report.healthy.succeeded
                + report.healthy.failed
                + report.faulting.succeeded
                + report.faulting.failed
                + report.total_pending()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn compartments_keep_the_healthy_lane_flowing() {
        // Same seed, same load, same scheduler; only the compartments differ.
        let guarded = demo_dispatcher(seeded(11));
        let guarded_report = guarded.run(&CancellationToken::new()).await;

        let exposed =
            demo_dispatcher(DispatcherConfig { use_bulkhead: false, ..seeded(11) });
        let exposed_report = exposed.run(&CancellationToken::new()).await;

        // Compartmented, the faulting lane can hold at most half the
        // scheduler, so healthy calls run as they arrive.
        assert!(
            guarded_report.healthy.pending() <= 3,
            "healthy lane backed up despite its compartment: {guarded_report:?}"
        );

        // Without compartments the 3s faulting calls eat the whole
        // scheduler and healthy calls pile up behind them.
        assert!(
            exposed_report.healthy.pending() > guarded_report.healthy.pending(),
            "expected starvation without compartments: {exposed_report:?}"
        );
        assert!(exposed_report.healthy.pending() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancellation_stops_the_run_early() {
        let dispatcher = demo_dispatcher(seeded(7));
        let external = CancellationToken::new();
        let cancel = external.clone();

        let run = tokio::spawn(async move {
            let dispatcher = dispatcher;
            dispatcher.run(&external).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let report = run.await.expect("run completes");

        // Roughly one call per 100ms for ~1s, far short of the full window.
        assert!(report.total_requested() >= 5, "got {}", report.total_requested());
        assert!(report.total_requested() <= 20, "got {}", report.total_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_calls_are_reported_pending_not_failed() {
        // All faulting: every call takes 3s, so cancelling at 1s leaves
        // every dispatched call in flight or queued, none resolved.
        let config = DispatcherConfig { faulting_ratio: 1.0, ..seeded(3) };
        let dispatcher = demo_dispatcher(config);
        let external = CancellationToken::new();
        let cancel = external.clone();

        let run = tokio::spawn(async move {
            let dispatcher = dispatcher;
            dispatcher.run(&external).await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let report = run.await.expect("run completes");

        assert_eq!(report.healthy.requested, 0);
        assert!(report.faulting.requested > 0);
        assert_eq!(report.faulting.succeeded, 0);
        assert_eq!(report.faulting.failed, 0, "nothing resolved before the cancel");
        assert_eq!(report.faulting.pending(), report.faulting.requested);
    }

    #[tokio::test(start_paused = true)]
    async fn ratio_extremes_route_every_call_to_one_lane() {
        let all_healthy = DispatcherConfig {
            faulting_ratio: 0.0,
            grace: Duration::from_secs(2),
            ..seeded(1)
        };
        let report = demo_dispatcher(all_healthy).run(&CancellationToken::new()).await;
        assert_eq!(report.faulting.requested, 0);
        assert!(report.healthy.requested > 0);
        assert!(report.healthy.succeeded > 0);
        assert_eq!(report.healthy.failed, 0);
        // A call spawned in the last pace interval may see the stop before
        // it is polled and stay pending.
        assert_eq!(
            report.healthy.requested,
            report.healthy.succeeded + report.healthy.pending()
        );

        let all_faulting = DispatcherConfig {
            faulting_ratio: 1.0,
            grace: Duration::from_secs(2),
            ..seeded(1)
        };
        let report = demo_dispatcher(all_faulting).run(&CancellationToken::new()).await;
        assert_eq!(report.healthy.requested, 0);
        assert!(report.faulting.requested > 0);
    }

    #[test]
    fn pending_is_derived_from_the_other_counters() {
        let stats = LaneStats { requested: 10, succeeded: 4, failed: 3 };
        assert_eq!(stats.pending(), 3);

        let complete = LaneStats { requested: 5, succeeded: 5, failed: 0 };
        assert_eq!(complete.pending(), 0);
    }
}
