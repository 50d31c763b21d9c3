//! Collector registry grouping collectors into named modules.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::collector::{Collector, CollectorError, ModuleHooks};

/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata about a registered collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectorInfo {
    /// Owning module name.
    pub module: String,
    /// Collector name.
    pub name: String,
}

/// A named group of collectors registered together.
#[derive(Clone)]
pub struct CollectorModule {
    name: String,
    collectors: Vec<Arc<dyn Collector>>,
    hooks: Option<Arc<dyn ModuleHooks>>,
}

impl CollectorModule {
    /// Create an empty module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collectors: Vec::new(),
            hooks: None,
        }
    }

    /// Append a collector. Registration order is the sequential invocation order.
    #[must_use]
    pub fn with_collector(mut self, collector: impl Collector) -> Self {
        self.collectors.push(Arc::new(collector));
        self
    }

    /// Append an already shared collector.
    #[must_use]
    pub fn with_shared(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Attach lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: impl ModuleHooks) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collectors(&self) -> &[Arc<dyn Collector>] {
        &self.collectors
    }

    pub fn hooks(&self) -> Option<&Arc<dyn ModuleHooks>> {
        self.hooks.as_ref()
    }
}

impl fmt::Debug for CollectorModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorModule")
            .field("name", &self.name)
            .field(
                "collectors",
                &self.collectors.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

/// Registry of collector modules.
///
/// Built once at startup and then shared read-only with the scheduler;
/// collector identities stay stable for the process lifetime.
#[derive(Debug, Default, Clone)]
pub struct CollectorRegistry {
    modules: Vec<CollectorModule>,
}

impl CollectorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module.
    ///
    /// # Errors
    /// Returns `CollectorError::InvalidOperation` if a module with the same
    /// name exists or a collector name repeats within the module.
    pub fn register(&mut self, module: CollectorModule) -> Result<(), CollectorError> {
        if self.modules.iter().any(|m| m.name == module.name) {
            return Err(CollectorError::InvalidOperation(format!(
                "module '{}' already registered",
                module.name
            )));
        }

        let mut seen = HashSet::new();
        for collector in &module.collectors {
            if !seen.insert(collector.name()) {
                return Err(CollectorError::InvalidOperation(format!(
                    "duplicate collector '{}' in module '{}'",
                    collector.name(),
                    module.name
                )));
            }
        }

        tracing::info!(
            module = %module.name,
            collectors = module.collectors.len(),
            "Collector module registered"
        );
        self.modules.push(module);
        Ok(())
    }

    /// Builder-style [`Self::register`].
    pub fn with_module(mut self, module: CollectorModule) -> Result<Self, CollectorError> {
        self.register(module)?;
        Ok(self)
    }

    pub fn modules(&self) -> &[CollectorModule] {
        &self.modules
    }

    /// Total number of collectors across modules.
    pub fn collector_count(&self) -> usize {
        self.modules.iter().map(|m| m.collectors.len()).sum()
    }

    /// List all registered collectors in registration order.
    pub fn list(&self) -> Vec<CollectorInfo> {
        self.modules
            .iter()
            .flat_map(|m| {
                m.collectors.iter().map(|c| CollectorInfo {
                    module: m.name.clone(),
                    name: c.name().to_string(),
                })
            })
            .collect()
    }

    /// Dispose every collector with the default timeout.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Dispose every collector, giving up after `timeout`.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> bool {
        let count = self.collector_count();
        let result = tokio::time::timeout(timeout, async {
            for module in &self.modules {
                for collector in &module.collectors {
                    collector.shutdown().await;
                    tracing::debug!(module = %module.name, collector = %collector.name(), "Collector disposed");
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(collectors = count, "Collector registry shutdown complete");
                true
            }
            Err(_) => {
                tracing::warn!(collectors = count, timeout = ?timeout, "Collector registry shutdown timed out");
                false
            }
        }
    }
}
