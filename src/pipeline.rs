//! Push export pipeline.
//!
//! ```text
//! cycle batch ──▶ PushExporter ──try_enqueue──▶ BoundedChannel ──▶ SenderWorker ──▶ RemoteClient
//!                   (producer)                  (drop & count)      (single consumer, retry)
//! ```
//!
//! Delivery is at-most-once and best effort: items rejected by the channel
//! are counted in `dropped` and never retried.

pub mod channel;
pub mod envelope;
pub mod http;
pub mod sender;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::exporter::{ExportError, ExportSummary, Exporter};
use crate::measurement::Measurement;
use crate::retry::RetryPolicy;
use crate::self_metrics::SelfMetrics;

use channel::{BoundedChannel, ChannelError, FullMode};
use envelope::Envelope;
use sender::{RemoteClient, SenderConfig, SenderWorker};

/// Queue and sender settings for one push pipeline.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub queue_capacity: usize,
    pub full_mode: FullMode,
    pub sender: SenderConfig,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            queue_capacity: channel::DEFAULT_QUEUE_CAPACITY,
            full_mode: FullMode::default(),
            sender: SenderConfig::default(),
        }
    }
}

/// Producer side of a push pipeline.
#[derive(Debug)]
pub struct PushExporter {
    name: String,
    channel: Arc<BoundedChannel<Envelope>>,
    cancel: CancellationToken,
}

impl PushExporter {
    pub fn new(
        name: impl Into<String>,
        channel: Arc<BoundedChannel<Envelope>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            channel,
            cancel,
        }
    }

    pub fn channel(&self) -> &Arc<BoundedChannel<Envelope>> {
        &self.channel
    }
}

#[async_trait::async_trait]
impl Exporter for PushExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, batch: &[Measurement]) -> Result<ExportSummary, ExportError> {
        let mut summary = ExportSummary::default();

        for (idx, measurement) in batch.iter().enumerate() {
            match self.channel.enqueue(Envelope::from(measurement), &self.cancel).await {
                Ok(true) => summary.accepted += 1,
                Ok(false) => summary.dropped += 1,
                Err(_) => {
                    summary.dropped += batch.len() - idx;
                    tracing::debug!(exporter = %self.name, "Enqueue interrupted by shutdown");
                    break;
                }
            }
        }

        if summary.dropped > 0 {
            tracing::warn!(
                exporter = %self.name,
                dropped = summary.dropped,
                capacity = self.channel.capacity(),
                "Push queue full, measurements dropped"
            );
        }
        Ok(summary)
    }
}

/// Both halves of a push pipeline sharing one channel.
pub struct PushPipeline<C> {
    pub exporter: Arc<PushExporter>,
    pub worker: Arc<SenderWorker<C>>,
}

impl<C: RemoteClient> PushPipeline<C> {
    /// Build the channel, exporter and sender worker.
    ///
    /// The worker is not started; call `worker.clone().spawn(cancel)`.
    ///
    /// # Errors
    /// Returns `ChannelError::ZeroCapacity` for a zero queue capacity.
    pub fn new(
        name: impl Into<String>,
        client: C,
        options: PushOptions,
        retry: RetryPolicy,
        metrics: Arc<SelfMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self, ChannelError> {
        let channel = Arc::new(BoundedChannel::new(
            options.queue_capacity,
            options.full_mode,
            Arc::clone(&metrics),
        )?);
        let exporter = Arc::new(PushExporter::new(name, Arc::clone(&channel), cancel));
        let worker = Arc::new(SenderWorker::new(
            channel,
            client,
            retry,
            options.sender,
            metrics,
        ));
        Ok(Self { exporter, worker })
    }
}
