//! Collector Layer
//!
//! Pluggable collectors grouped into named modules. The scheduler owns the
//! registry and invokes every collector once per collection cycle.
//!
//! # Architecture
//!
//! - [`Collector`]: Core trait for implementing data collectors
//! - [`CollectorRegistry`]: Module registration and shutdown
//! - [`RateCollector`]: Rate reporting over monotonic counters with clamped deltas
//! - [`host`]: `sysinfo` backed CPU, memory and network collectors
//!
//! # Example
//!
//! ```rust,no_run
//! use metron::collector::{CollectorModule, CollectorRegistry, host};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let module = host::host_module(host::HostProbe::detect(), &host::HostOptions::default());
//! let registry = CollectorRegistry::new().with_module(module)?;
//! assert!(registry.collector_count() > 0);
//! # let _ = CollectorModule::new("custom");
//! # Ok(())
//! # }
//! ```

mod delta;
pub mod host;
mod registry;
mod traits;

pub use delta::{
    CounterDelta, CounterSource, DEFAULT_MIN_WINDOW, DeltaOutcome, DeltaTracker, RateCollector,
    RawCounter, clamped_delta,
};
pub use registry::{CollectorInfo, CollectorModule, CollectorRegistry, DEFAULT_SHUTDOWN_TIMEOUT};
pub use traits::{Collector, CollectorError, ModuleHooks, degenerate_for};
