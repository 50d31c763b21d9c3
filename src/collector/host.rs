//! Host collectors backed by `sysinfo`.
//!
//! The platform is probed once at startup ([`HostProbe::detect`]); every
//! collector below is built for the selected strategy instead of branching
//! per call.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, Networks, System};
use tokio_util::sync::CancellationToken;

use super::delta::{CounterSource, DEFAULT_MIN_WINDOW, RateCollector, RawCounter};
use super::registry::CollectorModule;
use super::{Collector, CollectorError};
use crate::measurement::Measurement;

/// Module name the host collectors are registered under.
pub const HOST_MODULE: &str = "host";

/// Platform strategy for sampling system counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProbe {
    /// `sysinfo` supports this OS.
    Sysinfo,
    /// No sampling backend; collectors report `status=error`.
    Unsupported,
}

impl HostProbe {
    /// Select the strategy for the running platform.
    pub fn detect() -> Self {
        if sysinfo::IS_SUPPORTED_SYSTEM {
            Self::Sysinfo
        } else {
            Self::Unsupported
        }
    }
}

/// Which host collectors to build.
#[derive(Debug, Clone, PartialEq)]
pub struct HostOptions {
    pub cpu: bool,
    pub memory: bool,
    pub network: bool,
    pub network_min_window: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            cpu: true,
            memory: true,
            network: true,
            network_min_window: DEFAULT_MIN_WINDOW,
        }
    }
}

/// Build the `host` module for `probe`.
pub fn host_module(probe: HostProbe, options: &HostOptions) -> CollectorModule {
    let mut module = CollectorModule::new(HOST_MODULE);

    match probe {
        HostProbe::Sysinfo => {
            if options.cpu {
                module = module.with_collector(CpuCollector::new());
            }
            if options.memory {
                module = module.with_collector(MemoryCollector::new());
            }
            if options.network {
                module = module.with_collector(RateCollector::new(
                    "network",
                    NetworkSource::new(),
                    options.network_min_window,
                ));
            }
        }
        HostProbe::Unsupported => {
            tracing::warn!("Host platform not supported, host collectors report errors");
            for (enabled, name) in [
                (options.cpu, "cpu"),
                (options.memory, "memory"),
                (options.network, "network"),
            ] {
                if enabled {
                    module = module.with_collector(UnsupportedCollector::new(name));
                }
            }
        }
    }

    module
}

// =============================================================================
// CPU
// =============================================================================

struct CpuState {
    system: System,
    last_refresh: Option<Instant>,
}

/// CPU usage percentages (global and per core).
///
/// Usage is computed by `sysinfo` from the difference between two
/// refreshes, so the first call and calls closer together than
/// [`MINIMUM_CPU_UPDATE_INTERVAL`] report `status=empty`.
pub struct CpuCollector {
    state: Mutex<CpuState>,
}

impl CpuCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CpuState {
                system: System::new(),
                last_refresh: None,
            }),
        }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Collector for CpuCollector {
    fn name(&self) -> &str {
        "cpu"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Measurement>, CollectorError> {
        if cancel.is_cancelled() {
            return Ok(vec![Measurement::cancelled("cpu.usage")]);
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| CollectorError::InvalidOperation("cpu: state poisoned".to_string()))?;

        let now = Instant::now();
        if let Some(last) = state.last_refresh
            && now.saturating_duration_since(last) < MINIMUM_CPU_UPDATE_INTERVAL
        {
            return Ok(vec![Measurement::empty("cpu.usage")]);
        }

        state.system.refresh_cpu_all();
        let first = state.last_refresh.replace(now).is_none();
        if first {
            return Ok(vec![Measurement::empty("cpu.usage")]);
        }

        let mut points = vec![Measurement::gauge(
            "cpu.usage",
            f64::from(state.system.global_cpu_usage()),
        )];
        for (i, cpu) in state.system.cpus().iter().enumerate() {
            points.push(
                Measurement::gauge("cpu.core_usage", f64::from(cpu.cpu_usage()))
                    .with_tag("core", i.to_string()),
            );
        }
        Ok(points)
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Physical memory and swap gauges, in bytes.
pub struct MemoryCollector {
    system: Mutex<System>,
}

impl MemoryCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Measurement>, CollectorError> {
        if cancel.is_cancelled() {
            return Ok(vec![Measurement::cancelled("memory.used_bytes")]);
        }

        let mut system = self
            .system
            .lock()
            .map_err(|_| CollectorError::InvalidOperation("memory: state poisoned".to_string()))?;
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        let mut points = vec![
            Measurement::gauge("memory.total_bytes", total as f64),
            Measurement::gauge("memory.used_bytes", used as f64),
            Measurement::gauge("memory.available_bytes", system.available_memory() as f64),
            Measurement::gauge("memory.swap_total_bytes", system.total_swap() as f64),
            Measurement::gauge("memory.swap_used_bytes", system.used_swap() as f64),
        ];
        if total > 0 {
            points.push(Measurement::gauge(
                "memory.used_percent",
                used as f64 / total as f64 * 100.0,
            ));
        }
        Ok(points)
    }
}

// =============================================================================
// Network
// =============================================================================

/// Per-interface monotonic byte and packet counters.
pub struct NetworkSource {
    networks: Networks,
}

impl NetworkSource {
    pub fn new() -> Self {
        Self {
            networks: Networks::new_with_refreshed_list(),
        }
    }
}

impl Default for NetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterSource for NetworkSource {
    fn sample(&mut self) -> Result<Vec<RawCounter>, CollectorError> {
        self.networks.refresh();

        let mut counters = Vec::new();
        for (name, data) in self.networks.iter() {
            counters.extend([
                RawCounter::new("network.bytes_recv", data.total_received()),
                RawCounter::new("network.bytes_sent", data.total_transmitted()),
                RawCounter::new("network.packets_recv", data.total_packets_received()),
                RawCounter::new("network.packets_sent", data.total_packets_transmitted()),
            ]
            .map(|c| c.with_tag("interface", name.as_str())));
        }
        Ok(counters)
    }
}

// =============================================================================
// Unsupported platform
// =============================================================================

/// Placeholder reporting `status=error` on platforms without a backend.
pub struct UnsupportedCollector {
    name: String,
}

impl UnsupportedCollector {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait::async_trait]
impl Collector for UnsupportedCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, _cancel: &CancellationToken) -> Result<Vec<Measurement>, CollectorError> {
        Ok(vec![Measurement::error(
            self.name.clone(),
            "platform not supported",
        )])
    }
}
