//! Core collector traits and types.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::measurement::Measurement;

/// Errors that can escape a collection call.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// OS / file I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The process lacks permission to read the source.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The source does not exist on this host.
    #[error("not found: {0}")]
    NotFound(String),

    /// The platform lacks the required OS feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The collector was used after shutdown.
    #[error("collector disposed: {0}")]
    Disposed(String),

    /// The collector is in a state that does not allow collection.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A collector-internal deadline elapsed.
    #[error("timeout elapsed after {0:?}")]
    Timeout(Duration),

    /// The cancellation token fired.
    #[error("collection cancelled")]
    Cancelled,

    /// Anything else. Aborts the whole collection cycle.
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl CollectorError {
    /// Whether this error belongs to the recoverable categories that the
    /// scheduler isolates to the failing collector.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Unexpected(_))
    }

    /// Whether this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Translate an expected error into the degenerate measurement a collector
/// reports in place of a value.
///
/// Cancellation maps to a `status=cancelled` placeholder, every other error
/// to `status=error` with a truncated `reason` tag.
pub fn degenerate_for(name: &str, err: &CollectorError) -> Measurement {
    if err.is_cancelled() {
        Measurement::cancelled(name)
    } else {
        Measurement::error(name, err.to_string())
    }
}

/// Core collector trait for implementing data collectors.
///
/// # Error Handling Philosophy
///
/// The `collect()` method distinguishes between **partial sample failures**
/// and **collector errors**:
///
/// - **Partial failures** (one core unreadable, an interface vanished,
///   permission denied on a single file): report a degenerate measurement
///   (see [`degenerate_for`]) inside an `Ok` batch.
///
/// - **Collector errors**: return `Err`. Expected categories
///   ([`CollectorError::is_expected`]) are logged by the scheduler and the
///   collector contributes nothing this cycle; [`CollectorError::Unexpected`]
///   fails the whole cycle.
///
/// # Concurrency
///
/// Collectors registered with a parallel scheduler may be invoked
/// concurrently with themselves. Any "previous sample" state used for rate
/// computations must be owned by the instance behind its own lock.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Stable identifier used for logging and self-metrics.
    fn name(&self) -> &str;

    /// Perform one collection.
    ///
    /// Implementations must check `cancel` before any blocking I/O and
    /// periodically while enumerating.
    async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<Measurement>, CollectorError>;

    /// Release resources at process shutdown.
    async fn shutdown(&self) {}
}

/// Optional lifecycle hooks invoked around each module's collectors.
#[async_trait::async_trait]
pub trait ModuleHooks: Send + Sync + 'static {
    async fn before_collect(&self, _module: &str) {}

    async fn after_collect(&self, _module: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{REASON_TAG, Status};

    #[test]
    fn test_expected_classification() {
        assert!(CollectorError::Io(std::io::Error::other("boom")).is_expected());
        assert!(CollectorError::PermissionDenied("/proc/1".into()).is_expected());
        assert!(CollectorError::Unsupported("wmi".into()).is_expected());
        assert!(CollectorError::Disposed("cpu".into()).is_expected());
        assert!(CollectorError::Timeout(Duration::from_secs(1)).is_expected());
        assert!(CollectorError::Cancelled.is_expected());
        assert!(!CollectorError::Unexpected("bug".into()).is_expected());
    }

    #[test]
    fn test_degenerate_for_cancelled() {
        let m = degenerate_for("cpu.usage", &CollectorError::Cancelled);
        assert_eq!(m.status(), Status::Cancelled);
        assert_eq!(m.name(), "cpu.usage");
    }

    #[test]
    fn test_degenerate_for_error_truncates_reason() {
        let err = CollectorError::NotFound("x".repeat(400));
        let m = degenerate_for("disk.io", &err);
        assert_eq!(m.status(), Status::Error);
        let reason = m.tag(REASON_TAG).unwrap();
        assert!(reason.starts_with("not found: "));
        assert_eq!(reason.chars().count(), crate::measurement::MAX_TAG_VALUE_LEN);
    }
}
