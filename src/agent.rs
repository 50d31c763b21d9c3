//! Agent orchestration loop.
//!
//! One tick: run a collection cycle, apply the sampling policy, append
//! self-metrics and hand the batch to every exporter.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::exporter::Exporter;
use crate::policy::SamplingPolicy;
use crate::scheduler::{CollectionScheduler, CycleError, CycleReport};
use crate::self_metrics::SelfMetrics;

/// Default collection interval (15 seconds).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);

/// Default name prefix for self-metrics.
pub const DEFAULT_SELF_METRICS_PREFIX: &str = "metron_";

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub interval: Duration,
    /// Append self-metrics to every batch.
    pub self_metrics: bool,
    pub self_metrics_prefix: String,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            self_metrics: true,
            self_metrics_prefix: DEFAULT_SELF_METRICS_PREFIX.to_string(),
        }
    }
}

/// Ties the scheduler, sampling policy and exporters together.
pub struct Agent {
    scheduler: Arc<CollectionScheduler>,
    policy: SamplingPolicy,
    exporters: Vec<Arc<dyn Exporter>>,
    options: AgentOptions,
}

impl Agent {
    pub fn new(scheduler: Arc<CollectionScheduler>, options: AgentOptions) -> Self {
        Self {
            scheduler,
            policy: SamplingPolicy::default(),
            exporters: Vec::new(),
            options,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: SamplingPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn scheduler(&self) -> &Arc<CollectionScheduler> {
        &self.scheduler
    }

    pub fn metrics(&self) -> &Arc<SelfMetrics> {
        self.scheduler.metrics()
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    /// Run one cycle and return the filtered batch, without exporting.
    ///
    /// Self-metrics are appended after sampling and are never sampled out.
    ///
    /// # Errors
    /// Propagates the scheduler's `CycleError`.
    pub async fn collect_once(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let mut report = self.scheduler.run_cycle(cancel).await?;

        let sampled_out = self.policy.apply(&mut report.measurements);
        if sampled_out > 0 {
            tracing::trace!(sampled_out, rate = self.policy.rate(), "Sampling applied");
        }

        if self.options.self_metrics {
            report.measurements.extend(
                self.metrics()
                    .snapshot()
                    .to_measurements(&self.options.self_metrics_prefix),
            );
        }
        Ok(report)
    }

    /// Run one cycle and export it. Returns the number of measurements
    /// handed to exporters, or `None` when nothing was exported.
    pub async fn tick(&self, cancel: &CancellationToken) -> Option<usize> {
        let report = match self.collect_once(cancel).await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(reason = e.reason_code(), error = %e, "Cycle failed, export skipped");
                return None;
            }
        };

        if report.is_cancelled() {
            tracing::debug!("Cycle cancelled, export skipped");
            return None;
        }

        let batch = report.measurements;
        for exporter in &self.exporters {
            match exporter.export(&batch).await {
                Ok(summary) => tracing::debug!(
                    exporter = %exporter.name(),
                    accepted = summary.accepted,
                    dropped = summary.dropped,
                    "Batch exported"
                ),
                Err(e) => tracing::warn!(exporter = %exporter.name(), error = %e, "Export failed"),
            }
        }
        Some(batch.len())
    }

    /// Tick every `interval` until `cancel` fires. Missed ticks are skipped.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval = ?self.options.interval,
            collectors = self.scheduler.registry().collector_count(),
            exporters = self.exporters.len(),
            "Agent started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick(&cancel).await;
        }

        tracing::info!("Agent stopped");
    }
}
