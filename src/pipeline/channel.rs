//! Fixed-capacity multi-producer / single-consumer queue.
//!
//! Producers call [`BoundedChannel::try_enqueue`] (never blocks) or, in
//! [`FullMode::Block`], [`BoundedChannel::enqueue`]. The single consumer
//! drains with [`BoundedChannel::try_dequeue`] and parks in
//! [`BoundedChannel::dequeue`].
//!
//! # Usage contract
//!
//! The channel must have **exactly one consumer**. Nothing enforces this at
//! runtime; a second dequeuer would race the first on wake-ups and make
//! the approximate length unreliable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::self_metrics::SelfMetrics;

/// Default channel capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Behaviour when an item arrives at a full channel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FullMode {
    /// Reject the incoming item and count it as dropped.
    #[default]
    #[serde(alias = "drop_write")]
    #[strum(to_string = "drop_newest", serialize = "drop_write")]
    DropNewest,
    /// Accept the incoming item, evict and count the oldest queued one.
    DropOldest,
    /// `enqueue` waits for space; `try_enqueue` rejects like `DropNewest`.
    Block,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel operation cancelled")]
    Cancelled,

    #[error("channel capacity must be positive")]
    ZeroCapacity,
}

/// Bounded MPSC channel with drop-and-count backpressure.
pub struct BoundedChannel<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    full_mode: FullMode,
    approx_len: AtomicUsize,
    items: Notify,
    space: Notify,
    metrics: Arc<SelfMetrics>,
}

impl<T> std::fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedChannel")
            .field("capacity", &self.capacity)
            .field("full_mode", &self.full_mode)
            .field("approx_len", &self.approx_len.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Send> BoundedChannel<T> {
    /// Create a channel.
    ///
    /// # Errors
    /// Returns `ChannelError::ZeroCapacity` if `capacity == 0`.
    pub fn new(
        capacity: usize,
        full_mode: FullMode,
        metrics: Arc<SelfMetrics>,
    ) -> Result<Self, ChannelError> {
        if capacity == 0 {
            return Err(ChannelError::ZeroCapacity);
        }
        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            full_mode,
            approx_len: AtomicUsize::new(0),
            items: Notify::new(),
            space: Notify::new(),
            metrics,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn full_mode(&self) -> FullMode {
        self.full_mode
    }

    /// Best-effort queue depth, for observability only.
    pub fn approximate_len(&self) -> usize {
        self.approx_len.load(Ordering::Relaxed)
    }

    /// Non-blocking enqueue.
    ///
    /// Returns `false` (and counts a drop) if the channel is full and the
    /// mode rejects new items. Under `DropOldest` the item is always
    /// accepted and the evicted one is counted instead.
    pub fn try_enqueue(&self, item: T) -> bool {
        let mut queue = self.lock();

        if queue.len() >= self.capacity {
            match self.full_mode {
                FullMode::DropOldest => {
                    queue.pop_front();
                    queue.push_back(item);
                    drop(queue);
                    self.metrics.dropped.inc();
                    tracing::trace!(capacity = self.capacity, "Channel full, evicted oldest item");
                    self.items.notify_one();
                    return true;
                }
                FullMode::DropNewest | FullMode::Block => {
                    drop(queue);
                    self.metrics.dropped.inc();
                    tracing::trace!(capacity = self.capacity, "Channel full, item dropped");
                    return false;
                }
            }
        }

        queue.push_back(item);
        let len = self.approx_len.fetch_add(1, Ordering::Relaxed) + 1;
        drop(queue);
        self.metrics.queue_length.set(len as u64);
        self.items.notify_one();
        true
    }

    /// Enqueue, waiting for space in `Block` mode.
    ///
    /// Other modes behave exactly like [`Self::try_enqueue`].
    ///
    /// # Errors
    /// Returns `ChannelError::Cancelled` if `cancel` fires while waiting;
    /// the item is discarded.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<bool, ChannelError> {
        if self.full_mode != FullMode::Block {
            return Ok(self.try_enqueue(item));
        }

        let mut item = item;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            item = match self.push_if_space(item) {
                Ok(()) => return Ok(true),
                Err(back) => back,
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<T> {
        let mut queue = self.lock();
        let item = queue.pop_front()?;
        let len = self.approx_len.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        drop(queue);
        self.metrics.queue_length.set(len as u64);
        self.space.notify_waiters();
        Some(item)
    }

    /// Wait for the next item.
    ///
    /// # Errors
    /// Returns `ChannelError::Cancelled` if `cancel` fires before an item
    /// becomes available.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, ChannelError> {
        loop {
            let notified = self.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_dequeue() {
                return Ok(item);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChannelError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    fn push_if_space(&self, item: T) -> Result<(), T> {
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        let len = self.approx_len.fetch_add(1, Ordering::Relaxed) + 1;
        drop(queue);
        self.metrics.queue_length.set(len as u64);
        self.items.notify_one();
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::time::Duration;

    fn channel(capacity: usize, mode: FullMode) -> (Arc<BoundedChannel<u32>>, Arc<SelfMetrics>) {
        let metrics = Arc::new(SelfMetrics::new());
        let ch = BoundedChannel::new(capacity, mode, Arc::clone(&metrics)).unwrap();
        (Arc::new(ch), metrics)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = BoundedChannel::<u32>::new(0, FullMode::DropNewest, Arc::new(SelfMetrics::new()))
            .unwrap_err();
        assert_eq!(err, ChannelError::ZeroCapacity);
    }

    #[test]
    fn test_debug_shows_length() {
        let (ch, _) = channel(3, FullMode::DropNewest);
        assert!(ch.try_enqueue(7));
        let debug = format!("{ch:?}");
        assert!(debug.contains("capacity: 3"), "{debug}");
        assert!(debug.contains("approx_len: 1"), "{debug}");
    }

    #[test]
    fn test_capacity_plus_one_drops_one() {
        let (ch, metrics) = channel(4, FullMode::DropNewest);
        let accepted = (0..5).filter(|i| ch.try_enqueue(*i)).count();
        assert_eq!(accepted, 4);
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(ch.approximate_len(), 4);
        assert_eq!(metrics.queue_length.get(), 4);
    }

    #[test]
    fn test_fifo_order() {
        let (ch, metrics) = channel(8, FullMode::DropNewest);
        for i in 0..5 {
            assert!(ch.try_enqueue(i));
        }
        let drained: Vec<u32> = std::iter::from_fn(|| ch.try_dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert_eq!(ch.approximate_len(), 0);
        assert_eq!(metrics.queue_length.get(), 0);
        assert!(ch.try_dequeue().is_none());
    }

    #[test]
    fn test_drop_oldest_evicts_head() {
        let (ch, metrics) = channel(2, FullMode::DropOldest);
        assert!(ch.try_enqueue(1));
        assert!(ch.try_enqueue(2));
        assert!(ch.try_enqueue(3));
        assert_eq!(metrics.dropped.get(), 1);
        assert_eq!(ch.approximate_len(), 2);
        assert_eq!(ch.try_dequeue(), Some(2));
        assert_eq!(ch.try_dequeue(), Some(3));
    }

    #[test]
    fn test_block_mode_try_enqueue_rejects() {
        let (ch, metrics) = channel(1, FullMode::Block);
        assert!(ch.try_enqueue(1));
        assert!(!ch.try_enqueue(2));
        assert_eq!(metrics.dropped.get(), 1);
    }

    #[tokio::test]
    async fn test_block_mode_enqueue_waits_for_space() {
        let (ch, metrics) = channel(1, FullMode::Block);
        let cancel = CancellationToken::new();
        assert!(ch.enqueue(1, &cancel).await.unwrap());

        let producer = {
            let ch = Arc::clone(&ch);
            let cancel = cancel.clone();
            tokio::spawn(async move { ch.enqueue(2, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(ch.try_dequeue(), Some(1));

        let accepted = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(accepted);
        assert_eq!(ch.try_dequeue(), Some(2));
        assert_eq!(metrics.dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_block_mode_enqueue_cancelled() {
        let (ch, _) = channel(1, FullMode::Block);
        let cancel = CancellationToken::new();
        ch.enqueue(1, &cancel).await.unwrap();

        cancel.cancel();
        let err = ch.enqueue(2, &cancel).await.unwrap_err();
        assert_eq!(err, ChannelError::Cancelled);
        assert_eq!(ch.approximate_len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let (ch, _) = channel(4, FullMode::DropNewest);
        let cancel = CancellationToken::new();

        let consumer = {
            let ch = Arc::clone(&ch);
            let cancel = cancel.clone();
            tokio::spawn(async move { ch.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ch.try_enqueue(42));

        let item = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(item, 42);
    }

    #[tokio::test]
    async fn test_dequeue_cancelled() {
        let (ch, _) = channel(4, FullMode::DropNewest);
        let cancel = CancellationToken::new();

        let consumer = {
            let ch = Arc::clone(&ch);
            let cancel = cancel.clone();
            tokio::spawn(async move { ch.dequeue(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ChannelError::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_producers_respect_capacity() {
        let (ch, metrics) = channel(100, FullMode::DropNewest);
        let mut tasks = tokio::task::JoinSet::new();
        for p in 0..8u32 {
            let ch = Arc::clone(&ch);
            tasks.spawn(async move {
                let mut ok = 0u64;
                for i in 0..50 {
                    if ch.try_enqueue(p * 1000 + i) {
                        ok += 1;
                    }
                    assert!(ch.approximate_len() <= ch.capacity());
                    tokio::task::yield_now().await;
                }
                ok
            });
        }

        let mut accepted = 0;
        while let Some(res) = tasks.join_next().await {
            accepted += res.unwrap();
        }
        assert_eq!(accepted, 100);
        assert_eq!(metrics.dropped.get(), 300);
        assert_eq!(ch.approximate_len(), 100);
    }

    #[test]
    fn test_full_mode_parse() {
        assert_eq!(FullMode::from_str("drop_write").unwrap(), FullMode::DropNewest);
        assert_eq!(FullMode::from_str("DROP_OLDEST").unwrap(), FullMode::DropOldest);
        assert_eq!(FullMode::from_str("block").unwrap(), FullMode::Block);
        assert_eq!(FullMode::DropNewest.as_ref(), "drop_newest");

        let mode: FullMode = serde_yaml::from_str("drop_write").unwrap();
        assert_eq!(mode, FullMode::DropNewest);
    }
}
