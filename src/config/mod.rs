//! Configuration module.
//!
//! YAML-based configuration loading and validation for:
//! - Scrape server settings (bind address, port)
//! - Collection scheduling and sampling
//! - Push export, retry and queue settings
//! - Built-in host collectors

mod app;
mod collector;
mod push;
mod validation;

pub use app::{
    AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_PORT, SamplingConfig, ScheduleConfig,
    SelfMetricsConfig, ServerConfig,
};
pub use collector::{CollectorsConfig, NetworkCollectorConfig, ToggleConfig};
pub use push::{PushConfig, RetryConfig};
pub use validation::{ConfigError, expand_env_vars, parse_duration};
