//! Self-observability bookkeeping.
//!
//! Lock-free counters, gauges and latency histograms describing the agent's
//! own behaviour. Every update is a single atomic operation, so hot paths
//! (collector invocation, enqueue, send) never block on bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::measurement::{Bucket, Measurement};

/// Default histogram bucket upper bounds, in seconds.
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

// =============================================================================
// Primitives
// =============================================================================

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last-write-wins gauge.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    /// Store `value`, returning the previous one.
    pub fn set(&self, value: u64) -> u64 {
        self.0.swap(value, Ordering::Relaxed)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram.
#[derive(Debug)]
pub struct LatencyHistogram {
    bounds: &'static [f64],
    /// Non-cumulative per-bucket counts; the last slot is `+Inf`.
    buckets: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_BUCKETS)
    }
}

impl LatencyHistogram {
    pub fn new(bounds: &'static [f64]) -> Self {
        Self {
            bounds,
            buckets: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let idx = self
            .bounds
            .iter()
            .position(|b| secs <= *b)
            .unwrap_or(self.bounds.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Snapshot with cumulative buckets (excluding `+Inf`, which equals `count`).
    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(bound, slot)| {
                cumulative += slot.load(Ordering::Relaxed);
                Bucket {
                    upper_bound: *bound,
                    count: cumulative,
                }
            })
            .collect();
        HistogramSnapshot {
            buckets,
            sum_seconds: self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time histogram values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<Bucket>,
    pub sum_seconds: f64,
    pub count: u64,
}

// =============================================================================
// SelfMetrics
// =============================================================================

/// The agent's own counters and gauges.
///
/// Shared as `Arc<SelfMetrics>` by the scheduler, the bounded channel and
/// the sender worker. Reads are snapshot reads and may interleave with
/// concurrent writes.
#[derive(Debug, Default)]
pub struct SelfMetrics {
    pub collect_ok: Counter,
    pub collect_error: Counter,
    pub collect_cancelled: Counter,
    pub collector_timeouts: Counter,
    pub cycles_ok: Counter,
    pub cycles_failed: Counter,
    pub cycles_cancelled: Counter,
    pub export_ok: Counter,
    pub export_error: Counter,
    pub dropped: Counter,
    pub retries: Counter,
    pub send_failures: Counter,
    pub sent: Counter,
    pub last_batch_size: Gauge,
    pub last_send_duration_micros: Gauge,
    pub queue_length: Gauge,
    pub collect_duration: LatencyHistogram,
    pub export_duration: LatencyHistogram,
}

impl SelfMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing one collector invocation.
    pub fn start_collect(self: &Arc<Self>) -> CollectScope {
        CollectScope {
            metrics: Arc::clone(self),
            started: Instant::now(),
        }
    }

    /// Start timing one batch export.
    pub fn start_export(self: &Arc<Self>) -> ExportScope {
        ExportScope {
            metrics: Arc::clone(self),
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> SelfMetricsSnapshot {
        SelfMetricsSnapshot {
            collect_ok: self.collect_ok.get(),
            collect_error: self.collect_error.get(),
            collect_cancelled: self.collect_cancelled.get(),
            collector_timeouts: self.collector_timeouts.get(),
            cycles_ok: self.cycles_ok.get(),
            cycles_failed: self.cycles_failed.get(),
            cycles_cancelled: self.cycles_cancelled.get(),
            export_ok: self.export_ok.get(),
            export_error: self.export_error.get(),
            dropped: self.dropped.get(),
            retries: self.retries.get(),
            send_failures: self.send_failures.get(),
            sent: self.sent.get(),
            last_batch_size: self.last_batch_size.get(),
            last_send_duration_micros: self.last_send_duration_micros.get(),
            queue_length: self.queue_length.get(),
            collect_duration: self.collect_duration.snapshot(),
            export_duration: self.export_duration.snapshot(),
        }
    }
}

/// Serializable view of [`SelfMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelfMetricsSnapshot {
    pub collect_ok: u64,
    pub collect_error: u64,
    pub collect_cancelled: u64,
    pub collector_timeouts: u64,
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub cycles_cancelled: u64,
    pub export_ok: u64,
    pub export_error: u64,
    pub dropped: u64,
    pub retries: u64,
    pub send_failures: u64,
    pub sent: u64,
    pub last_batch_size: u64,
    pub last_send_duration_micros: u64,
    pub queue_length: u64,
    pub collect_duration: HistogramSnapshot,
    pub export_duration: HistogramSnapshot,
}

impl SelfMetricsSnapshot {
    /// Render as measurements, each name prefixed with `prefix`.
    pub fn to_measurements(&self, prefix: &str) -> Vec<Measurement> {
        let counters = [
            ("collect_total", self.collect_ok, "ok"),
            ("collect_total", self.collect_error, "error"),
            ("collect_total", self.collect_cancelled, "cancelled"),
            ("cycles_total", self.cycles_ok, "ok"),
            ("cycles_total", self.cycles_failed, "error"),
            ("cycles_total", self.cycles_cancelled, "cancelled"),
            ("export_total", self.export_ok, "ok"),
            ("export_total", self.export_error, "error"),
        ];

        let mut out: Vec<Measurement> = counters
            .into_iter()
            .map(|(name, value, outcome)| {
                Measurement::counter(name, value as f64).with_tag("outcome", outcome)
            })
            .collect();

        out.extend([
            Measurement::counter("collector_timeouts_total", self.collector_timeouts as f64),
            Measurement::counter("dropped_total", self.dropped as f64),
            Measurement::counter("retries_total", self.retries as f64),
            Measurement::counter("send_failures_total", self.send_failures as f64),
            Measurement::counter("sent_total", self.sent as f64),
            Measurement::gauge("last_batch_size", self.last_batch_size as f64),
            Measurement::gauge(
                "last_send_duration_seconds",
                self.last_send_duration_micros as f64 / 1_000_000.0,
            ),
            Measurement::gauge("queue_length", self.queue_length as f64),
            Measurement::histogram(
                "collect_duration_seconds",
                self.collect_duration.buckets.clone(),
                self.collect_duration.sum_seconds,
                self.collect_duration.count,
            ),
            Measurement::histogram(
                "export_duration_seconds",
                self.export_duration.buckets.clone(),
                self.export_duration.sum_seconds,
                self.export_duration.count,
            ),
        ]);

        out.into_iter().map(|m| m.prefixed(prefix)).collect()
    }
}

// =============================================================================
// Scopes
// =============================================================================

/// Timing scope for one collector invocation.
///
/// Completing consumes the scope, so each invocation is recorded once.
#[must_use = "a scope records nothing until completed"]
pub struct CollectScope {
    metrics: Arc<SelfMetrics>,
    started: Instant,
}

impl CollectScope {
    pub fn ok(self) -> Duration {
        self.finish(&self.metrics.collect_ok)
    }

    pub fn error(self) -> Duration {
        self.finish(&self.metrics.collect_error)
    }

    pub fn cancelled(self) -> Duration {
        self.finish(&self.metrics.collect_cancelled)
    }

    fn finish(&self, counter: &Counter) -> Duration {
        let elapsed = self.started.elapsed();
        self.metrics.collect_duration.observe(elapsed);
        counter.inc();
        elapsed
    }
}

/// Timing scope for one export (send) of a batch.
#[must_use = "a scope records nothing until completed"]
pub struct ExportScope {
    metrics: Arc<SelfMetrics>,
    started: Instant,
}

impl ExportScope {
    /// Record a successful export of `batch_size` items.
    pub fn ok(self, batch_size: usize) -> Duration {
        let elapsed = self.finish(batch_size);
        self.metrics.export_ok.inc();
        self.metrics.sent.add(batch_size as u64);
        elapsed
    }

    pub fn error(self, batch_size: usize) -> Duration {
        let elapsed = self.finish(batch_size);
        self.metrics.export_error.inc();
        elapsed
    }

    /// Abandoned on shutdown: neither success nor failure is recorded.
    pub fn cancelled(self) -> Duration {
        self.started.elapsed()
    }

    fn finish(&self, batch_size: usize) -> Duration {
        let elapsed = self.started.elapsed();
        self.metrics.export_duration.observe(elapsed);
        self.metrics.last_batch_size.set(batch_size as u64);
        self.metrics
            .last_send_duration_micros
            .set(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX));
        elapsed
    }
}
