//! Delta and rate computation for monotonic counters.
//!
//! [`DeltaTracker`] keeps the previous raw sample of a collector instance and
//! turns consecutive samples into clamped deltas. [`RateCollector`] wraps any
//! [`CounterSource`] into a collector reporting per-second rates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorError};
use crate::measurement::{Measurement, Tags};

/// Default minimum window between two samples for a rate to be reported.
pub const DEFAULT_MIN_WINDOW: Duration = Duration::from_secs(1);

/// Delta between two raw counter readings.
///
/// Monotonic counters never regress in reported deltas: a reset or wrap
/// (`current < previous`) yields `0`.
pub fn clamped_delta(previous: u64, current: u64) -> u64 {
    current.saturating_sub(previous)
}

/// One raw reading of a monotonic counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCounter {
    /// Metric name the rate is reported under.
    pub name: String,
    /// Identity tags (e.g. `interface=eth0`).
    pub tags: Tags,
    /// Raw counter value.
    pub value: u64,
}

impl RawCounter {
    pub fn new(name: impl Into<String>, value: u64) -> Self {
        Self {
            name: name.into(),
            tags: Tags::new(),
            value,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    fn series_key(&self) -> String {
        let mut key = self.name.clone();
        for (k, v) in &self.tags {
            key.push('|');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

/// Delta for a single counter series over `elapsed`.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterDelta {
    pub name: String,
    pub tags: Tags,
    pub delta: u64,
}

impl CounterDelta {
    /// Per-second rate over `elapsed`.
    pub fn rate(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.delta as f64 / secs
        } else {
            0.0
        }
    }
}

/// Result of feeding a sample into a [`DeltaTracker`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    /// No usable baseline (first sample, or the window is too short).
    Empty,
    /// Deltas against the previous sample.
    Ready {
        elapsed: Duration,
        deltas: Vec<CounterDelta>,
    },
}

#[derive(Debug)]
struct Snapshot {
    at: Instant,
    values: HashMap<String, u64>,
}

/// Double-buffered previous-sample state for one collector instance.
#[derive(Debug)]
pub struct DeltaTracker {
    min_window: Duration,
    previous: Option<Snapshot>,
}

impl DeltaTracker {
    pub fn new(min_window: Duration) -> Self {
        Self {
            min_window,
            previous: None,
        }
    }

    /// Feed a new sample taken at `now`.
    ///
    /// A sample arriving sooner than the minimum window after the baseline
    /// is discarded and the baseline kept, so the next call measures over
    /// the full gap. Series without a baseline are skipped until the
    /// following sample.
    pub fn observe(&mut self, now: Instant, counters: Vec<RawCounter>) -> DeltaOutcome {
        let values: HashMap<String, u64> = counters
            .iter()
            .map(|c| (c.series_key(), c.value))
            .collect();

        let Some(previous) = self.previous.take() else {
            self.previous = Some(Snapshot { at: now, values });
            return DeltaOutcome::Empty;
        };

        let elapsed = now.saturating_duration_since(previous.at);
        if elapsed < self.min_window {
            self.previous = Some(previous);
            return DeltaOutcome::Empty;
        }

        let deltas = counters
            .into_iter()
            .filter_map(|c| {
                let prev = previous.values.get(&c.series_key())?;
                Some(CounterDelta {
                    delta: clamped_delta(*prev, c.value),
                    name: c.name,
                    tags: c.tags,
                })
            })
            .collect();

        self.previous = Some(Snapshot { at: now, values });
        DeltaOutcome::Ready { elapsed, deltas }
    }
}

/// Platform strategy producing raw monotonic counters.
pub trait CounterSource: Send + 'static {
    /// Read the current counter values.
    fn sample(&mut self) -> Result<Vec<RawCounter>, CollectorError>;
}

struct RateState<S> {
    source: S,
    tracker: DeltaTracker,
}

/// Collector reporting per-second rates (`<counter>.rate` gauges) from a
/// [`CounterSource`].
///
/// The first call after construction, and any call inside the minimum
/// window, reports a single `status=empty` measurement.
pub struct RateCollector<S> {
    name: String,
    state: Mutex<RateState<S>>,
}

impl<S: CounterSource> RateCollector<S> {
    pub fn new(name: impl Into<String>, source: S, min_window: Duration) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RateState {
                source,
                tracker: DeltaTracker::new(min_window),
            }),
        }
    }

    fn sample_rates(&self) -> Result<Vec<Measurement>, CollectorError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CollectorError::InvalidOperation(format!("{}: state poisoned", self.name)))?;

        let counters = match state.source.sample() {
            Ok(counters) => counters,
            Err(e) if e.is_expected() => {
                tracing::warn!(collector = %self.name, error = %e, "Counter sample failed");
                return Ok(vec![crate::collector::degenerate_for(&self.name, &e)]);
            }
            Err(e) => return Err(e),
        };

        match state.tracker.observe(Instant::now(), counters) {
            DeltaOutcome::Empty => Ok(vec![Measurement::empty(self.name.clone())]),
            DeltaOutcome::Ready { elapsed, deltas } => Ok(deltas
                .into_iter()
                .map(|d| {
                    Measurement::gauge(format!("{}.rate", d.name), d.rate(elapsed))
                        .with_tags(d.tags.iter())
                })
                .collect()),
        }
    }
}

#[async_trait::async_trait]
impl<S: CounterSource> Collector for RateCollector<S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Measurement>, CollectorError> {
        if cancel.is_cancelled() {
            return Ok(vec![Measurement::cancelled(self.name.clone())]);
        }
        self.sample_rates()
    }
}
