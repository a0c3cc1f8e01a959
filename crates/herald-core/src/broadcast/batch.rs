//! Per-channel batch queues.
//!
//! Channel-scoped envelopes wait here until a timer tick or until their queue
//! reaches the size cap. The flush callback runs while the channel's shard is
//! still locked, so two flushes of the same channel can never hand their
//! batches to the publisher out of order.

use super::envelope::Envelope;
use crate::ids::ChannelId;
use dashmap::DashMap;
use tracing::trace;

/// Default flush interval.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 10;

/// Default size cap of one queue.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 100;

#[derive(Debug)]
pub struct BatchQueues {
    queues: DashMap<ChannelId, Vec<Envelope>>,
    max_size: usize,
}

impl BatchQueues {
    /// Create queues flushing at `max_size` envelopes (minimum 1).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queues: DashMap::new(),
            max_size: max_size.max(1),
        }
    }

    /// Enqueue an envelope for `channel`.
    ///
    /// When the queue reaches the cap it is drained into `flush` right away.
    /// Returns `true` if that happened.
    pub fn push<F>(&self, channel: &str, envelope: Envelope, flush: F) -> bool
    where
        F: FnOnce(Vec<Envelope>),
    {
        let mut queue = self.queues.entry(channel.to_string()).or_default();
        queue.push(envelope);
        if queue.len() < self.max_size {
            return false;
        }
        let batch = std::mem::take(&mut *queue);
        trace!(channel = %channel, size = batch.len(), "Batch queue full, flushing");
        flush(batch);
        true
    }

    /// Drain every non-empty queue into `flush`.
    ///
    /// Returns the number of envelopes drained.
    pub fn drain<F>(&self, mut flush: F) -> usize
    where
        F: FnMut(&str, Vec<Envelope>),
    {
        let mut drained = 0;
        for mut queue in self.queues.iter_mut() {
            if queue.is_empty() {
                continue;
            }
            let batch = std::mem::take(queue.value_mut());
            drained += batch.len();
            flush(queue.key(), batch);
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        drained
    }

    /// Envelopes waiting across all queues.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    /// Number of channels with a queue.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}
