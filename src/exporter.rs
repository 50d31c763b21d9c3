//! Exporter abstraction.
//!
//! A push exporter receives each filtered cycle batch through
//! [`Exporter::export`]. Pull-style exposition is a formatter over the
//! same batch, see [`prometheus`].

pub mod prometheus;

use thiserror::Error;

use crate::measurement::Measurement;

/// Push transport failures.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection could not be established.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The remote answered with a non-success status.
    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The payload could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Any other request failure.
    #[error("request failed: {0}")]
    Request(String),
}

impl ExportError {
    /// Whether a retry may succeed: timeouts, connection failures and
    /// HTTP 408 / 429 / 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) => true,
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Encode(_) | Self::Request(_) => false,
        }
    }
}

/// Outcome of handing one batch to an exporter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// Items accepted for delivery.
    pub accepted: usize,
    /// Items rejected by backpressure.
    pub dropped: usize,
}

/// Destination for filtered cycle batches.
///
/// Implementations must not block the caller on remote I/O; push exporters
/// hand the batch to a queue drained by a background sender.
#[async_trait::async_trait]
pub trait Exporter: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn export(&self, batch: &[Measurement]) -> Result<ExportSummary, ExportError>;
}
