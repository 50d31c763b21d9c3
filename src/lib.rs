//! Metron - metrics collection agent
//!
//! A registry of pluggable collectors sampled on a schedule, a sampling and
//! filter policy, and exporters: a Prometheus scrape endpoint and a push
//! pipeline with a bounded queue, a single sender and retry with full jitter.
//!
//! # Architecture
//!
//! - **Collectors**: host probes and custom [`Collector`] implementations,
//!   grouped into modules in a [`CollectorRegistry`]
//! - **Scheduler**: per-cycle fan-out with timeouts and failure isolation
//! - **Policy**: probabilistic sampling and name filtering
//! - **Pipeline**: bounded channel, sender worker, HTTP push client
//! - **Self-metrics**: the agent's own counters, gauges and histograms
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use metron::{Agent, AgentOptions, CollectionScheduler, CollectorRegistry, SelfMetrics};
//! use metron::collector::host::{self, HostOptions, HostProbe};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CollectorRegistry::new()
//!     .with_module(host::host_module(HostProbe::detect(), &HostOptions::default()))?;
//! let scheduler = CollectionScheduler::new(
//!     Arc::new(registry),
//!     Default::default(),
//!     Arc::new(SelfMetrics::new()),
//! );
//! let agent = Agent::new(Arc::new(scheduler), AgentOptions::default());
//! let report = agent.collect_once(&CancellationToken::new()).await?;
//! println!("{}", metron::exporter::prometheus::render(&report.measurements));
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod collector;
pub mod config;
pub mod exporter;
pub mod measurement;
pub mod pipeline;
pub mod policy;
pub mod retry;
pub mod scheduler;
pub mod self_metrics;
pub mod server;

pub use agent::{Agent, AgentOptions};
pub use collector::{Collector, CollectorError, CollectorModule, CollectorRegistry};
pub use exporter::{ExportError, Exporter};
pub use measurement::{Measurement, MetricKind, Status};
pub use pipeline::{PushExporter, PushOptions, PushPipeline};
pub use policy::SamplingPolicy;
pub use retry::{RetryError, RetryPolicy};
pub use scheduler::{CollectionScheduler, CycleError, CycleOutcome, CycleReport, SchedulerConfig};
pub use self_metrics::SelfMetrics;
