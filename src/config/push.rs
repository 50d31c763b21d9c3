//! Push pipeline and retry configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::pipeline::PushOptions;
use crate::pipeline::channel::{DEFAULT_QUEUE_CAPACITY, FullMode};
use crate::pipeline::http::DEFAULT_REQUEST_TIMEOUT;
use crate::pipeline::sender::{DEFAULT_EMPTY_QUEUE_DELAY, DEFAULT_MAX_BATCH_SIZE, SenderConfig};
use crate::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, RetryPolicy};

use super::validation::{ConfigError, expand_env_vars};

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_empty_queue_delay() -> Duration {
    DEFAULT_EMPTY_QUEUE_DELAY
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

// =============================================================================
// Push
// =============================================================================

/// HTTP push exporter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Remote ingest URL; required when enabled.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Extra request headers. Values support `${VAR}` and `${VAR:-default}`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub full_mode: FullMode,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_empty_queue_delay", with = "humantime_serde")]
    pub empty_queue_delay: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            headers: BTreeMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            full_mode: FullMode::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            empty_queue_delay: DEFAULT_EMPTY_QUEUE_DELAY,
        }
    }
}

impl PushConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("push.queue_capacity", "must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::invalid("push.max_batch_size", "must be positive"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("push.request_timeout", "must be positive"));
        }
        if self.enabled {
            self.endpoint_url()?;
        }
        Ok(())
    }

    /// Parse the endpoint.
    ///
    /// # Errors
    /// Returns a validation error if the endpoint is missing, unparsable or
    /// not http(s).
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let raw = self
            .endpoint
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("push.endpoint", "required when push is enabled"))?;
        let url = Url::parse(&expand_env_vars(raw))
            .map_err(|e| ConfigError::invalid("push.endpoint", format!("invalid URL '{raw}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "push.endpoint",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        Ok(url)
    }

    /// Headers with environment references expanded.
    pub fn resolved_headers(&self) -> BTreeMap<String, String> {
        self.headers
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_vars(v)))
            .collect()
    }

    pub fn to_push_options(&self) -> PushOptions {
        PushOptions {
            queue_capacity: self.queue_capacity,
            full_mode: self.full_mode,
            sender: SenderConfig {
                max_batch_size: self.max_batch_size,
                empty_queue_delay: self.empty_queue_delay,
            },
        }
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry policy for push sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "retry.base_delay",
                format!(
                    "{:?} exceeds retry.max_delay {:?}",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        Ok(())
    }

    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.base_delay, self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_defaults() {
        let config: PushConfig = serde_yaml::from_str("enabled: false").unwrap();
        assert_eq!(config, PushConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_push_full_yaml() {
        let yaml = r#"
enabled: true
endpoint: "https://ingest.example.com/v1/points"
headers:
  x-api-key: "${METRON_PUSH_TEST_KEY:-dev}"
request_timeout: 3s
queue_capacity: 64
full_mode: drop_write
max_batch_size: 16
empty_queue_delay: 50ms
"#;
        let config: PushConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.full_mode, FullMode::DropNewest);
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.resolved_headers()["x-api-key"], "dev");

        let options = config.to_push_options();
        assert_eq!(options.queue_capacity, 64);
        assert_eq!(options.sender.max_batch_size, 16);
        assert_eq!(options.sender.empty_queue_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_push_enabled_requires_endpoint() {
        let config = PushConfig {
            enabled: true,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("push.endpoint"));
    }

    #[test]
    fn test_push_rejects_non_http_scheme() {
        let config = PushConfig {
            enabled: true,
            endpoint: Some("ftp://example.com/".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_push_zero_capacity_rejected() {
        let config = PushConfig {
            queue_capacity: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("push.queue_capacity"));
    }

    #[test]
    fn test_retry_delay_order() {
        let config = RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(1),
        };
        assert!(config.validate().is_err());

        let config: RetryConfig = serde_yaml::from_str("base_delay: 50ms").unwrap();
        config.validate().unwrap();
        assert_eq!(config.to_policy().max_attempts(), DEFAULT_MAX_ATTEMPTS);
    }
}
