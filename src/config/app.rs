//! Application configuration structures.

use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentOptions, DEFAULT_INTERVAL, DEFAULT_SELF_METRICS_PREFIX};
use crate::policy::{NameFilter, SamplingPolicy};
use crate::scheduler::{DEFAULT_COLLECTOR_TIMEOUT, SchedulerConfig, default_parallelism};

use super::collector::CollectorsConfig;
use super::push::{PushConfig, RetryConfig};
use super::validation::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Default scrape port (the OpenTelemetry Prometheus exporter port).
pub const DEFAULT_PORT: u16 = 9464;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_collector_timeout() -> Duration {
    DEFAULT_COLLECTOR_TIMEOUT
}

fn default_true() -> bool {
    true
}

fn default_rate() -> f64 {
    1.0
}

fn default_prefix() -> String {
    DEFAULT_SELF_METRICS_PREFIX.to_string()
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Scrape server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 9464).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

// =============================================================================
// Scheduler Configuration
// =============================================================================

/// Collection cycle settings (`scheduler` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Time between cycles (default: 15s).
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Worker pool size; host CPU count when absent.
    #[serde(default)]
    pub parallelism: Option<usize>,

    /// Per-collector timeout (default: 5s, `0s` disables).
    #[serde(default = "default_collector_timeout", with = "humantime_serde")]
    pub collector_timeout: Duration,

    #[serde(default = "default_true")]
    pub cancel_fast: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            parallel: true,
            parallelism: None,
            collector_timeout: DEFAULT_COLLECTOR_TIMEOUT,
            cancel_fast: true,
        }
    }
}

impl ScheduleConfig {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            parallel: self.parallel,
            parallelism: self.parallelism.unwrap_or_else(default_parallelism),
            collector_timeout: (!self.collector_timeout.is_zero()).then_some(self.collector_timeout),
            cancel_fast: self.cancel_fast,
        }
    }
}

// =============================================================================
// Sampling Configuration
// =============================================================================

/// Sampling rate and name filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Keep probability in `[0, 1]` (default: 1.0).
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Regexes; a name must match one of them when non-empty.
    #[serde(default)]
    pub include: Vec<String>,

    /// Regexes; a matching name is dropped.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl SamplingConfig {
    /// Build the policy, compiling the filter patterns.
    ///
    /// # Errors
    /// Returns a validation error for a rate outside `[0, 1]` or a bad
    /// pattern.
    pub fn to_policy(&self) -> Result<SamplingPolicy, ConfigError> {
        if !(0.0..=1.0).contains(&self.rate) {
            return Err(ConfigError::invalid(
                "sampling.rate",
                format!("{} is outside [0, 1]", self.rate),
            ));
        }
        let filter = NameFilter::new(self.include.as_slice(), self.exclude.as_slice())
            .map_err(|e| ConfigError::invalid("sampling.include/exclude", e))?;
        Ok(SamplingPolicy::new(self.rate).with_filter(filter))
    }
}

// =============================================================================
// Self-Metrics Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfMetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name prefix (default: "metron_").
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for SelfMetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_prefix(),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub scheduler: ScheduleConfig,
    pub sampling: SamplingConfig,
    pub push: PushConfig,
    pub retry: RetryConfig,
    pub self_metrics: SelfMetricsConfig,
    pub collectors: CollectorsConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    /// Returns `ConfigError` if the document cannot be parsed or validated.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::invalid(
                "server.bind",
                format!("invalid address '{}'", self.server.bind),
            )
        })?;
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be non-zero"));
        }

        if self.scheduler.interval.is_zero() {
            return Err(ConfigError::invalid("scheduler.interval", "must be positive"));
        }
        if self.scheduler.parallelism == Some(0) {
            return Err(ConfigError::invalid("scheduler.parallelism", "must be positive"));
        }

        self.sampling.to_policy()?;
        self.push.validate()?;
        self.retry.validate()?;
        self.collectors.validate()?;
        Ok(())
    }

    pub fn agent_options(&self) -> AgentOptions {
        AgentOptions {
            interval: self.scheduler.interval,
            self_metrics: self.self_metrics.enabled,
            self_metrics_prefix: self.self_metrics.prefix.clone(),
        }
    }
}
