//! Single-consumer sender loop.
//!
//! Each tick drains up to `max_batch_size` envelopes with non-blocking
//! dequeues and submits them as one batch under the retry policy. An empty
//! tick sleeps for `empty_queue_delay`. A batch that still fails after the
//! retries is logged, counted and dropped; the loop keeps going.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use strum_macros::{AsRefStr, Display};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::channel::BoundedChannel;
use super::envelope::Envelope;
use crate::exporter::ExportError;
use crate::retry::{RetryError, RetryPolicy};
use crate::self_metrics::SelfMetrics;

// =============================================================================
// Constants
// =============================================================================

/// Default maximum envelopes per batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

/// Default sleep after an empty tick (200 milliseconds).
pub const DEFAULT_EMPTY_QUEUE_DELAY: Duration = Duration::from_millis(200);

// =============================================================================
// Remote client
// =============================================================================

/// Remote push endpoint.
///
/// `submit` is called once per envelope of a batch, then `flush` once. A
/// retried batch is submitted again from the first envelope, so `flush`
/// must discard whatever it buffered when it fails.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    async fn submit(&self, envelope: &Envelope) -> Result<(), ExportError>;

    async fn flush(&self) -> Result<(), ExportError>;
}

/// Decides which send failures are worth retrying.
pub type TransientClassifier = Arc<dyn Fn(&ExportError) -> bool + Send + Sync>;

// =============================================================================
// State
// =============================================================================

/// Sender state machine: `Idle -> Draining -> Sending -> (Idle | RetryWait)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SenderState {
    Idle,
    Draining,
    Sending,
    RetryWait,
    Stopped,
}

impl SenderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Draining,
            2 => Self::Sending,
            3 => Self::RetryWait,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Draining => 1,
            Self::Sending => 2,
            Self::RetryWait => 3,
            Self::Stopped => 4,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Queue was empty; the worker slept.
    Idle,
    /// The batch was delivered.
    Sent(usize),
    /// The batch failed terminally and was dropped.
    Failed(usize),
    /// Shutdown was requested before the batch completed.
    Cancelled,
}

// =============================================================================
// Worker
// =============================================================================

/// Sender tuning.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub max_batch_size: usize,
    pub empty_queue_delay: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            empty_queue_delay: DEFAULT_EMPTY_QUEUE_DELAY,
        }
    }
}

/// The one consumer of a push pipeline's [`BoundedChannel`].
pub struct SenderWorker<C> {
    channel: Arc<BoundedChannel<Envelope>>,
    client: C,
    retry: RetryPolicy,
    classifier: TransientClassifier,
    config: SenderConfig,
    metrics: Arc<SelfMetrics>,
    state: AtomicU8,
}

impl<C> fmt::Debug for SenderWorker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderWorker")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<C> SenderWorker<C> {
    pub fn state(&self) -> SenderState {
        SenderState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: SenderState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }
}

impl<C: RemoteClient> SenderWorker<C> {
    pub fn new(
        channel: Arc<BoundedChannel<Envelope>>,
        client: C,
        retry: RetryPolicy,
        config: SenderConfig,
        metrics: Arc<SelfMetrics>,
    ) -> Self {
        Self {
            channel,
            client,
            retry,
            classifier: Arc::new(ExportError::is_transient),
            config,
            metrics,
            state: AtomicU8::new(SenderState::Idle.as_u8()),
        }
    }

    /// Replace the transient-failure classifier.
    #[must_use]
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&ExportError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Spawn [`Self::run`] on the runtime.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            max_batch_size = self.config.max_batch_size,
            empty_queue_delay = ?self.config.empty_queue_delay,
            "Sender worker started"
        );

        while !cancel.is_cancelled() {
            self.tick(&cancel).await;
        }

        self.set_state(SenderState::Stopped);
        tracing::info!(pending = self.channel.approximate_len(), "Sender worker stopped");
    }

    /// One loop iteration.
    pub async fn tick(&self, cancel: &CancellationToken) -> TickOutcome {
        self.set_state(SenderState::Draining);
        let batch = self.drain();

        if batch.is_empty() {
            self.set_state(SenderState::Idle);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.empty_queue_delay) => {}
            }
            return TickOutcome::Idle;
        }

        let outcome = self.send(&batch, cancel).await;
        if outcome != TickOutcome::Cancelled {
            self.set_state(SenderState::Idle);
        }
        outcome
    }

    fn drain(&self) -> Vec<Envelope> {
        let mut batch = Vec::new();
        while batch.len() < self.config.max_batch_size {
            match self.channel.try_dequeue() {
                Some(envelope) => batch.push(envelope),
                None => break,
            }
        }
        batch
    }

    async fn send(&self, batch: &[Envelope], cancel: &CancellationToken) -> TickOutcome {
        let size = batch.len();
        let scope = self.metrics.start_export();

        let result = self
            .retry
            .run(
                cancel,
                |e: &ExportError| (self.classifier)(e),
                |retry: u32, e: &ExportError| {
                    self.metrics.retries.inc();
                    self.set_state(SenderState::RetryWait);
                    tracing::warn!(retry, batch = size, error = %e, "Transient send failure, retrying");
                },
                |_| self.send_batch(batch),
            )
            .await;

        match result {
            Ok(()) => {
                let elapsed = scope.ok(size);
                tracing::debug!(batch = size, elapsed = ?elapsed, "Batch sent");
                TickOutcome::Sent(size)
            }
            Err(RetryError::Cancelled) => {
                scope.cancelled();
                self.set_state(SenderState::Stopped);
                tracing::info!(batch = size, "Batch abandoned on shutdown");
                TickOutcome::Cancelled
            }
            Err(e) => {
                scope.error(size);
                self.metrics.send_failures.inc();
                tracing::error!(batch = size, error = %e, "Batch send failed, dropping batch");
                TickOutcome::Failed(size)
            }
        }
    }

    async fn send_batch(&self, batch: &[Envelope]) -> Result<(), ExportError> {
        self.set_state(SenderState::Sending);
        for envelope in batch {
            self.client.submit(envelope).await?;
        }
        self.client.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use crate::pipeline::channel::FullMode;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Records flushed batches; fails the first `failures` flushes.
    #[derive(Default)]
    struct ScriptedClient {
        failures: AtomicUsize,
        fatal: bool,
        flush_calls: AtomicUsize,
        pending: Mutex<Vec<Envelope>>,
        delivered: Mutex<Vec<Vec<Envelope>>>,
    }

    impl ScriptedClient {
        fn failing(n: usize) -> Self {
            Self {
                failures: AtomicUsize::new(n),
                ..Default::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl RemoteClient for ScriptedClient {
        async fn submit(&self, envelope: &Envelope) -> Result<(), ExportError> {
            self.pending.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        async fn flush(&self) -> Result<(), ExportError> {
            self.flush_calls.fetch_add(1, Ordering::SeqCst);
            let batch = std::mem::take(&mut *self.pending.lock().unwrap());
            if self.fatal {
                return Err(ExportError::Status {
                    status: 400,
                    body: "bad request".into(),
                });
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ExportError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            self.delivered.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn setup(
        client: ScriptedClient,
        max_attempts: u32,
        max_batch_size: usize,
    ) -> (Arc<BoundedChannel<Envelope>>, SenderWorker<ScriptedClient>, Arc<SelfMetrics>) {
        let metrics = Arc::new(SelfMetrics::new());
        let channel =
            Arc::new(BoundedChannel::new(16, FullMode::DropNewest, Arc::clone(&metrics)).unwrap());
        let worker = SenderWorker::new(
            Arc::clone(&channel),
            client,
            RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5)),
            SenderConfig {
                max_batch_size,
                empty_queue_delay: Duration::from_millis(5),
            },
            Arc::clone(&metrics),
        );
        (channel, worker, metrics)
    }

    fn envelope(name: &str) -> Envelope {
        Envelope::from(Measurement::gauge(name, 1.0))
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let (channel, worker, metrics) = setup(ScriptedClient::failing(2), 3, 10);
        assert!(channel.try_enqueue(envelope("a")));
        assert!(channel.try_enqueue(envelope("b")));

        let outcome = worker.tick(&CancellationToken::new()).await;
        assert_eq!(outcome, TickOutcome::Sent(2));
        assert_eq!(worker.client().flush_calls.load(Ordering::SeqCst), 3);

        let delivered = worker.client().delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.export_ok, 1);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.send_failures, 0);
        assert_eq!(snap.sent, 2);
        assert_eq!(worker.state(), SenderState::Idle);
    }

    #[tokio::test]
    async fn test_exhausted_batch_dropped_and_loop_continues() {
        let (channel, worker, metrics) = setup(ScriptedClient::failing(3), 2, 10);
        channel.try_enqueue(envelope("a"));

        let outcome = worker.tick(&CancellationToken::new()).await;
        assert_eq!(outcome, TickOutcome::Failed(1));
        assert_eq!(metrics.send_failures.get(), 1);
        assert_eq!(metrics.export_error.get(), 1);

        // Next batch goes through
        channel.try_enqueue(envelope("b"));
        let outcome = worker.tick(&CancellationToken::new()).await;
        assert_eq!(outcome, TickOutcome::Sent(1));
        assert_eq!(metrics.send_failures.get(), 1);
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let client = ScriptedClient {
            fatal: true,
            ..Default::default()
        };
        let (channel, worker, metrics) = setup(client, 5, 10);
        channel.try_enqueue(envelope("a"));

        assert_eq!(worker.tick(&CancellationToken::new()).await, TickOutcome::Failed(1));
        assert_eq!(worker.client().flush_calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.retries.get(), 0);
    }

    #[tokio::test]
    async fn test_custom_classifier() {
        let (channel, worker, metrics) = setup(ScriptedClient::failing(1), 3, 10);
        let worker = worker.with_classifier(|_| false);
        channel.try_enqueue(envelope("a"));

        assert_eq!(worker.tick(&CancellationToken::new()).await, TickOutcome::Failed(1));
        assert_eq!(metrics.retries.get(), 0);
    }

    #[tokio::test]
    async fn test_drains_at_most_max_batch_size() {
        let (channel, worker, _) = setup(ScriptedClient::default(), 0, 3);
        for i in 0..5 {
            channel.try_enqueue(envelope(&format!("m{i}")));
        }

        let cancel = CancellationToken::new();
        assert_eq!(worker.tick(&cancel).await, TickOutcome::Sent(3));
        assert_eq!(worker.tick(&cancel).await, TickOutcome::Sent(2));
        assert_eq!(worker.tick(&cancel).await, TickOutcome::Idle);

        let delivered = worker.client().delivered.lock().unwrap();
        let names: Vec<&str> = delivered.iter().flatten().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_cancelled_tick_abandons_batch() {
        let (channel, worker, metrics) = setup(ScriptedClient::failing(1), 3, 10);
        channel.try_enqueue(envelope("a"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(worker.tick(&cancel).await, TickOutcome::Cancelled);
        assert_eq!(worker.client().flush_calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.send_failures.get(), 0);
        assert_eq!(metrics.export_error.get(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let (channel, worker, metrics) = setup(ScriptedClient::default(), 3, 10);
        let worker = Arc::new(worker);
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&worker).spawn(cancel.clone());

        channel.try_enqueue(envelope("a"));
        for _ in 0..100 {
            if metrics.sent.get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(metrics.sent.get(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(worker.state(), SenderState::Stopped);
    }
}
