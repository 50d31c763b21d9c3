//! Host collector configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::DEFAULT_MIN_WINDOW;
use crate::collector::host::HostOptions;

use super::validation::ConfigError;

fn default_enabled() -> bool {
    true
}

fn default_min_window() -> Duration {
    DEFAULT_MIN_WINDOW
}

/// On/off switch for a collector without further settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for ToggleConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Network rate collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCollectorConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Minimum gap between samples before a rate is computed (default: 1s).
    #[serde(default = "default_min_window", with = "humantime_serde")]
    pub min_window: Duration,
}

impl Default for NetworkCollectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_window: DEFAULT_MIN_WINDOW,
        }
    }
}

/// Built-in host collectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorsConfig {
    pub cpu: ToggleConfig,
    pub memory: ToggleConfig,
    pub network: NetworkCollectorConfig,
}

impl CollectorsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.enabled && self.network.min_window.is_zero() {
            return Err(ConfigError::invalid(
                "collectors.network.min_window",
                "must be positive",
            ));
        }
        Ok(())
    }

    pub fn enabled_count(&self) -> usize {
        [self.cpu.enabled, self.memory.enabled, self.network.enabled]
            .into_iter()
            .filter(|e| *e)
            .count()
    }

    pub fn to_host_options(&self) -> HostOptions {
        HostOptions {
            cpu: self.cpu.enabled,
            memory: self.memory.enabled,
            network: self.network.enabled,
            network_min_window: self.network.min_window,
        }
    }
}
