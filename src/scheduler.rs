//! Collection scheduler.
//!
//! Runs every registered collector once per cycle, sequentially or with a
//! bounded worker pool, and merges their output into one unordered batch.
//!
//! # Failure isolation
//!
//! Each invocation gets its own child cancellation token. A per-collector
//! timeout cancels only that token, so a slow collector never affects its
//! siblings. Expected collector errors and timeouts are logged and the
//! collector contributes nothing this cycle. Unexpected errors and panics
//! abort the cycle with a [`CycleError`].
//!
//! # Reentrancy
//!
//! Only one cycle runs at a time per scheduler; concurrent callers wait on
//! a single-slot gate. Every invocation task holds a share of the gate
//! guard and is aborted when the cycle future is dropped, so the next cycle
//! cannot start until the previous cycle's collectors are gone.
//! Collector-private delta state is therefore never touched by two
//! overlapping sweeps.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strum_macros::{AsRefStr, Display};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorModule, CollectorRegistry};
use crate::measurement::Measurement;
use crate::self_metrics::SelfMetrics;

// =============================================================================
// Configuration
// =============================================================================

/// Default per-collector timeout (5 seconds).
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Default degree of parallelism: available CPU count.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Run collectors of a module concurrently.
    pub parallel: bool,
    /// Maximum concurrent invocations in parallel mode.
    pub parallelism: usize,
    /// Per-collector timeout; `None` disables it.
    pub collector_timeout: Option<Duration>,
    /// Skip remaining collectors as soon as the cycle token fires.
    pub cancel_fast: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel: true,
            parallelism: default_parallelism(),
            collector_timeout: Some(DEFAULT_COLLECTOR_TIMEOUT),
            cancel_fast: true,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// A cycle aborted by an unexpected collector failure.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("collector '{module}/{collector}' failed unexpectedly: {reason}")]
    Unexpected {
        module: String,
        collector: String,
        reason: String,
    },

    #[error("collector task in module '{module}' panicked: {reason}")]
    Panicked { module: String, reason: String },
}

impl CycleError {
    /// Stable machine-readable reason for hosts and HTTP responses.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Unexpected { .. } => "collector_unexpected_error",
            Self::Panicked { .. } => "collector_panicked",
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum CycleOutcome {
    Completed,
    /// The cycle token fired; the batch may be partial.
    Cancelled,
}

/// Result of one successful (possibly partial) cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Unordered union of every collector's batch.
    pub measurements: Vec<Measurement>,
    pub outcome: CycleOutcome,
    pub succeeded: usize,
    /// Expected errors (logged, no contribution).
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    /// Not invoked because of cancellation.
    pub skipped: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            measurements: Vec::new(),
            outcome: CycleOutcome::Completed,
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            cancelled: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == CycleOutcome::Cancelled
    }

    fn record(&mut self, invocation: Invocation) -> Result<(), CycleError> {
        match invocation {
            Invocation::Collected(batch) => {
                self.succeeded += 1;
                self.measurements.extend(batch);
            }
            Invocation::Failed => self.failed += 1,
            Invocation::TimedOut => self.timed_out += 1,
            Invocation::Cancelled => self.cancelled += 1,
            Invocation::Fatal(e) => return Err(e),
        }
        Ok(())
    }
}

/// Outcome of a single collector invocation.
enum Invocation {
    Collected(Vec<Measurement>),
    Failed,
    TimedOut,
    Cancelled,
    Fatal(CycleError),
}

// =============================================================================
// Scheduler
// =============================================================================

/// Orchestrates collection cycles over a [`CollectorRegistry`].
pub struct CollectionScheduler {
    registry: Arc<CollectorRegistry>,
    config: SchedulerConfig,
    gate: Arc<Mutex<()>>,
    pool: Arc<Semaphore>,
    metrics: Arc<SelfMetrics>,
}

impl std::fmt::Debug for CollectionScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionScheduler")
            .field("config", &self.config)
            .field("collectors", &self.registry.collector_count())
            .finish_non_exhaustive()
    }
}

impl CollectionScheduler {
    pub fn new(
        registry: Arc<CollectorRegistry>,
        config: SchedulerConfig,
        metrics: Arc<SelfMetrics>,
    ) -> Self {
        let permits = config.parallelism.max(1);
        Self {
            registry,
            config,
            gate: Arc::new(Mutex::new(())),
            pool: Arc::new(Semaphore::new(permits)),
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<CollectorRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SelfMetrics> {
        &self.metrics
    }

    /// Run one collection cycle.
    ///
    /// # Errors
    /// Returns `CycleError` if a collector failed with an unexpected error or
    /// panicked. Cancellation is not an error: it yields a report with
    /// [`CycleOutcome::Cancelled`].
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let started = Instant::now();

        if self.config.cancel_fast && cancel.is_cancelled() {
            return Ok(self.cancelled_before_start(started));
        }

        let gate = if self.config.cancel_fast {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(self.cancelled_before_start(started)),
                guard = Arc::clone(&self.gate).lock_owned() => guard,
            }
        } else {
            Arc::clone(&self.gate).lock_owned().await
        };
        let gate = Arc::new(gate);

        let mut report = CycleReport::new();
        for module in self.registry.modules() {
            if self.config.cancel_fast && cancel.is_cancelled() {
                report.skipped += module.collectors().len();
                continue;
            }

            if let Some(hooks) = module.hooks() {
                hooks.before_collect(module.name()).await;
            }

            let result = if self.config.parallel {
                self.run_parallel(module, cancel, &gate, &mut report).await
            } else {
                self.run_sequential(module, cancel, &gate, &mut report).await
            };

            if let Some(hooks) = module.hooks() {
                hooks.after_collect(module.name()).await;
            }

            if let Err(e) = result {
                self.metrics.cycles_failed.inc();
                tracing::error!(
                    module = %module.name(),
                    reason = e.reason_code(),
                    error = %e,
                    "Collection cycle aborted"
                );
                return Err(e);
            }
        }

        report.elapsed = started.elapsed();
        if cancel.is_cancelled() {
            report.outcome = CycleOutcome::Cancelled;
            self.metrics.cycles_cancelled.inc();
            tracing::info!(
                collected = report.measurements.len(),
                skipped = report.skipped,
                "Collection cycle cancelled"
            );
        } else {
            self.metrics.cycles_ok.inc();
            tracing::debug!(
                measurements = report.measurements.len(),
                succeeded = report.succeeded,
                failed = report.failed,
                timed_out = report.timed_out,
                elapsed = ?report.elapsed,
                "Collection cycle completed"
            );
        }
        Ok(report)
    }

    fn cancelled_before_start(&self, started: Instant) -> CycleReport {
        self.metrics.cycles_cancelled.inc();
        tracing::info!("Collection cycle cancelled before start");
        CycleReport {
            outcome: CycleOutcome::Cancelled,
            skipped: self.registry.collector_count(),
            elapsed: started.elapsed(),
            ..CycleReport::new()
        }
    }

    fn invoker(
        &self,
        module: &CollectorModule,
        collector: &Arc<dyn Collector>,
        cancel: &CancellationToken,
        gate: &Arc<OwnedMutexGuard<()>>,
    ) -> Invoker {
        Invoker {
            module: module.name().to_string(),
            collector: Arc::clone(collector),
            outer: cancel.clone(),
            timeout: self.config.collector_timeout,
            cancel_fast: self.config.cancel_fast,
            metrics: Arc::clone(&self.metrics),
            _gate: Arc::clone(gate),
        }
    }

    async fn run_sequential(
        &self,
        module: &CollectorModule,
        cancel: &CancellationToken,
        gate: &Arc<OwnedMutexGuard<()>>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        for collector in module.collectors() {
            if self.config.cancel_fast && cancel.is_cancelled() {
                report.skipped += 1;
                continue;
            }

            // A JoinSet aborts the invocation if this future is dropped.
            let mut task = JoinSet::new();
            task.spawn(self.invoker(module, collector, cancel, gate).invoke());
            let invocation = match task.join_next().await {
                Some(Ok(invocation)) => invocation,
                Some(Err(e)) => Invocation::Fatal(panicked(module.name(), &e)),
                None => continue,
            };
            report.record(invocation)?;
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        module: &CollectorModule,
        cancel: &CancellationToken,
        gate: &Arc<OwnedMutexGuard<()>>,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let mut tasks = JoinSet::new();

        for collector in module.collectors() {
            let pool = Arc::clone(&self.pool);
            let permit = if self.config.cancel_fast {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = pool.acquire_owned() => permit.ok(),
                }
            } else {
                pool.acquire_owned().await.ok()
            };

            let Some(permit) = permit else {
                report.skipped += 1;
                continue;
            };

            let invoker = self.invoker(module, collector, cancel, gate);
            tasks.spawn(async move {
                let _permit = permit;
                invoker.invoke().await
            });
        }

        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let invocation = match joined {
                Ok(invocation) => invocation,
                Err(e) if e.is_cancelled() => {
                    // Aborted after a sibling's fatal error.
                    self.metrics.collect_cancelled.inc();
                    report.cancelled += 1;
                    continue;
                }
                Err(e) => Invocation::Fatal(panicked(module.name(), &e)),
            };
            if let Err(e) = report.record(invocation)
                && fatal.is_none()
            {
                tasks.abort_all();
                fatal = Some(e);
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn panicked(module: &str, err: &JoinError) -> CycleError {
    CycleError::Panicked {
        module: module.to_string(),
        reason: err.to_string(),
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Everything one collector invocation needs, owned so it can run on its
/// own task.
struct Invoker {
    module: String,
    collector: Arc<dyn Collector>,
    outer: CancellationToken,
    timeout: Option<Duration>,
    cancel_fast: bool,
    metrics: Arc<SelfMetrics>,
    _gate: Arc<OwnedMutexGuard<()>>,
}

impl Invoker {
    async fn invoke(self) -> Invocation {
        let token = self.outer.child_token();
        let scope = self.metrics.start_collect();
        let name = self.collector.name();

        let run = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, self.collector.collect(&token))
                    .await
                    .ok(),
                None => Some(self.collector.collect(&token).await),
            }
        };

        let result = if self.cancel_fast {
            tokio::select! {
                biased;
                _ = self.outer.cancelled() => {
                    token.cancel();
                    scope.cancelled();
                    tracing::debug!(module = %self.module, collector = %name, "Collector abandoned on cancellation");
                    return Invocation::Cancelled;
                }
                result = run => result,
            }
        } else {
            run.await
        };

        let Some(result) = result else {
            token.cancel();
            if self.outer.is_cancelled() {
                scope.cancelled();
                return Invocation::Cancelled;
            }
            self.metrics.collector_timeouts.inc();
            scope.error();
            tracing::warn!(
                module = %self.module,
                collector = %name,
                timeout = ?self.timeout,
                "Collector timed out, result dropped for this cycle"
            );
            return Invocation::TimedOut;
        };

        match result {
            Ok(batch) => {
                let elapsed = scope.ok();
                tracing::debug!(
                    module = %self.module,
                    collector = %name,
                    measurements = batch.len(),
                    elapsed = ?elapsed,
                    "Collector succeeded"
                );
                Invocation::Collected(batch)
            }
            Err(e) if e.is_cancelled() && self.outer.is_cancelled() => {
                scope.cancelled();
                tracing::debug!(module = %self.module, collector = %name, "Collector cancelled");
                Invocation::Cancelled
            }
            Err(e) if e.is_expected() => {
                scope.error();
                tracing::warn!(
                    module = %self.module,
                    collector = %name,
                    error = %e,
                    "Collector failed, skipped for this cycle"
                );
                Invocation::Failed
            }
            Err(e) => {
                scope.error();
                Invocation::Fatal(CycleError::Unexpected {
                    module: self.module.clone(),
                    collector: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectorError, ModuleHooks};
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // =========================================================================
    // Fixtures
    // =========================================================================

    enum Behavior {
        Value(f64),
        Expected,
        Unexpected,
        Hang,
        Panic,
        CancelOuter(CancellationToken),
        Track {
            in_flight: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
            hold: Duration,
        },
    }

    struct InFlight(Arc<AtomicUsize>);

    impl Drop for InFlight {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct Fake {
        name: String,
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    impl Fake {
        fn new(name: &str, behavior: Behavior, calls: &Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                behavior,
                calls: Arc::clone(calls),
            }
        }
    }

    #[async_trait::async_trait]
    impl Collector for Fake {
        fn name(&self) -> &str {
            &self.name
        }

        async fn collect(
            &self,
            cancel: &CancellationToken,
        ) -> Result<Vec<Measurement>, CollectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Value(v) => Ok(vec![Measurement::gauge(self.name.clone(), *v)]),
                Behavior::Expected => Err(CollectorError::PermissionDenied("/proc/stat".into())),
                Behavior::Unexpected => Err(CollectorError::Unexpected("corrupt state".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(vec![])
                }
                Behavior::Panic => panic!("collector bug"),
                Behavior::CancelOuter(token) => {
                    token.cancel();
                    Ok(vec![Measurement::gauge(self.name.clone(), 1.0)])
                }
                Behavior::Track {
                    in_flight,
                    peak,
                    hold,
                } => {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    let _guard = InFlight(Arc::clone(in_flight));
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(*hold) => {}
                    }
                    Ok(vec![Measurement::gauge(self.name.clone(), 1.0)])
                }
            }
        }
    }

    fn config(parallel: bool) -> SchedulerConfig {
        SchedulerConfig {
            parallel,
            parallelism: 4,
            collector_timeout: Some(Duration::from_secs(2)),
            cancel_fast: true,
        }
    }

    fn scheduler(module: CollectorModule, config: SchedulerConfig) -> CollectionScheduler {
        let registry = CollectorRegistry::new().with_module(module).unwrap();
        CollectionScheduler::new(Arc::new(registry), config, Arc::new(SelfMetrics::new()))
    }

    fn values(report: &CycleReport) -> HashMap<String, f64> {
        report
            .measurements
            .iter()
            .map(|m| (m.name().to_string(), m.scalar().unwrap()))
            .collect()
    }

    // =========================================================================
    // Tests
    // =========================================================================

    #[tokio::test]
    async fn test_sequential_cycle_merges_batches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new("fake")
            .with_collector(Fake::new("x", Behavior::Value(5.0), &calls))
            .with_collector(Fake::new("y", Behavior::Value(7.0), &calls));
        let s = scheduler(module, config(false));

        let report = s.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(
            values(&report),
            HashMap::from([("x".to_string(), 5.0), ("y".to_string(), 7.0)])
        );
        assert_eq!(report.succeeded, 2);
        assert_eq!(s.metrics().cycles_ok.get(), 1);
        assert_eq!(s.metrics().collect_ok.get(), 2);
    }

    #[tokio::test]
    async fn test_expected_failure_isolated() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake")
                .with_collector(Fake::new("one", Behavior::Value(1.0), &calls))
                .with_collector(Fake::new("two", Behavior::Expected, &calls))
                .with_collector(Fake::new("three", Behavior::Value(3.0), &calls));
            let s = scheduler(module, config(parallel));

            let report = s.run_cycle(&CancellationToken::new()).await.unwrap();
            let got = values(&report);
            assert_eq!(got.len(), 2, "parallel={parallel}");
            assert_eq!(got["one"], 1.0);
            assert_eq!(got["three"], 3.0);
            assert_eq!(report.failed, 1);
            assert_eq!(s.metrics().collect_error.get(), 1);
        }
    }

    #[tokio::test]
    async fn test_pre_cancelled_invokes_nothing() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake")
                .with_collector(Fake::new("x", Behavior::Value(5.0), &calls))
                .with_collector(Fake::new("y", Behavior::Value(7.0), &calls));
            let s = scheduler(module, config(parallel));

            let cancel = CancellationToken::new();
            cancel.cancel();
            let report = s.run_cycle(&cancel).await.unwrap();

            assert!(report.is_cancelled());
            assert!(report.measurements.is_empty());
            assert_eq!(report.skipped, 2);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
            assert_eq!(s.metrics().cycles_cancelled.get(), 1);
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_cycle_skips_remaining() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let module = CollectorModule::new("fake")
            .with_collector(Fake::new("first", Behavior::CancelOuter(cancel.clone()), &calls))
            .with_collector(Fake::new("second", Behavior::Value(2.0), &calls))
            .with_collector(Fake::new("third", Behavior::Value(3.0), &calls));
        let s = scheduler(module, config(false));

        let report = s.run_cycle(&cancel).await.unwrap();
        assert!(report.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_cancel_fast_disabled_still_runs_collectors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new("fake")
            .with_collector(Fake::new("x", Behavior::Value(5.0), &calls))
            .with_collector(Fake::new("y", Behavior::Value(7.0), &calls));
        let s = scheduler(
            module,
            SchedulerConfig {
                cancel_fast: false,
                ..config(false)
            },
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = s.run_cycle(&cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.measurements.len(), 2);
        assert!(report.is_cancelled());
    }

    #[tokio::test]
    async fn test_timeout_drops_only_slow_collector() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake")
                .with_collector(Fake::new("fast", Behavior::Value(1.0), &calls))
                .with_collector(Fake::new("slow", Behavior::Hang, &calls));
            let s = scheduler(
                module,
                SchedulerConfig {
                    collector_timeout: Some(Duration::from_millis(50)),
                    ..config(parallel)
                },
            );

            let report = s.run_cycle(&CancellationToken::new()).await.unwrap();
            assert_eq!(report.outcome, CycleOutcome::Completed);
            assert_eq!(report.timed_out, 1);
            assert_eq!(values(&report).keys().collect::<Vec<_>>(), vec!["fast"]);
            assert_eq!(s.metrics().collector_timeouts.get(), 1);
        }
    }

    #[tokio::test]
    async fn test_unexpected_error_aborts_cycle() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake")
                .with_collector(Fake::new("ok", Behavior::Value(1.0), &calls))
                .with_collector(Fake::new("broken", Behavior::Unexpected, &calls));
            let s = scheduler(module, config(parallel));

            let err = s.run_cycle(&CancellationToken::new()).await.unwrap_err();
            assert_eq!(err.reason_code(), "collector_unexpected_error");
            assert!(err.to_string().contains("fake/broken"));
            assert_eq!(s.metrics().cycles_failed.get(), 1);
        }
    }

    #[tokio::test]
    async fn test_panic_aborts_cycle() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake")
                .with_collector(Fake::new("boom", Behavior::Panic, &calls));
            let s = scheduler(module, config(parallel));

            let err = s.run_cycle(&CancellationToken::new()).await.unwrap_err();
            assert_eq!(err.reason_code(), "collector_panicked");
        }
    }

    #[tokio::test]
    async fn test_parallelism_bounded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut module = CollectorModule::new("fake");
        for i in 0..6 {
            module = module.with_collector(Fake::new(
                &format!("c{i}"),
                Behavior::Track {
                    in_flight: Arc::clone(&in_flight),
                    peak: Arc::clone(&peak),
                    hold: Duration::from_millis(30),
                },
                &calls,
            ));
        }
        let s = scheduler(
            module,
            SchedulerConfig {
                parallelism: 2,
                ..config(true)
            },
        );

        let report = s.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.measurements.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_concurrent_cycles_serialize() {
        let calls = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new("fake").with_collector(Fake::new(
            "tracked",
            Behavior::Track {
                in_flight: Arc::clone(&in_flight),
                peak: Arc::clone(&peak),
                hold: Duration::from_millis(30),
            },
            &calls,
        ));
        let s = Arc::new(scheduler(module, config(true)));

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(s.run_cycle(&cancel), s.run_cycle(&cancel));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_cycle_never_overlaps_next() {
        for parallel in [false, true] {
            let calls = Arc::new(AtomicUsize::new(0));
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let module = CollectorModule::new("fake").with_collector(Fake::new(
                "tracked",
                Behavior::Track {
                    in_flight: Arc::clone(&in_flight),
                    peak: Arc::clone(&peak),
                    hold: Duration::from_millis(300),
                },
                &calls,
            ));
            let s = scheduler(module, config(parallel));
            let cancel = CancellationToken::new();

            let dropped =
                tokio::time::timeout(Duration::from_millis(50), s.run_cycle(&cancel)).await;
            assert!(dropped.is_err(), "parallel={parallel}");

            let report = s.run_cycle(&cancel).await.unwrap();
            assert_eq!(report.succeeded, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 2);
            assert_eq!(peak.load(Ordering::SeqCst), 1, "parallel={parallel}");
            assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_fatal_error_counts_aborted_siblings_cancelled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new("fake")
            .with_collector(Fake::new("slow", Behavior::Hang, &calls))
            .with_collector(Fake::new("broken", Behavior::Unexpected, &calls));
        let s = scheduler(module, config(true));

        let err = s.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.reason_code(), "collector_unexpected_error");
        let metrics = s.metrics();
        assert_eq!(metrics.collect_error.get(), 1);
        assert_eq!(metrics.collect_cancelled.get(), 1);
        assert_eq!(
            metrics.collect_ok.get() + metrics.collect_error.get() + metrics.collect_cancelled.get(),
            2
        );
    }

    #[tokio::test]
    async fn test_module_hooks_wrap_collectors() {
        struct Recorder(Arc<StdMutex<Vec<String>>>);

        #[async_trait::async_trait]
        impl ModuleHooks for Recorder {
            async fn before_collect(&self, module: &str) {
                self.0.lock().unwrap().push(format!("before:{module}"));
            }

            async fn after_collect(&self, module: &str) {
                self.0.lock().unwrap().push(format!("after:{module}"));
            }
        }

        let log = Arc::new(StdMutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new("fake")
            .with_collector(Fake::new("x", Behavior::Value(1.0), &calls))
            .with_hooks(Recorder(Arc::clone(&log)));
        let s = scheduler(module, config(false));

        s.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before:fake", "after:fake"]);
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let s = CollectionScheduler::new(
            Arc::new(CollectorRegistry::new()),
            SchedulerConfig::default(),
            Arc::new(SelfMetrics::new()),
        );
        let report = s.run_cycle(&CancellationToken::new()).await.unwrap();
        assert!(report.measurements.is_empty());
        assert_eq!(report.outcome, CycleOutcome::Completed);
    }
}
