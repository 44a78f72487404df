//! Bounded FIFO of metrics waiting to be sent.
//!
//! `poll` is destructive: a metric handed to the consumer is no longer in
//! the queue, so it can never be sent twice. A failed send puts the batch
//! back through `rollback`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::metric::Metric;

/// Queue statistics.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub offered: AtomicU64,
    /// Oldest metrics evicted because the queue was full.
    pub dropped: AtomicU64,
    pub polled: AtomicU64,
    pub rolled_back: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub offered: u64,
    pub dropped: u64,
    pub polled: u64,
    pub rolled_back: u64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            offered: self.offered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            polled: self.polled.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
pub struct MetricQueue {
    inner: Mutex<VecDeque<Metric>>,
    capacity: usize,
    stats: QueueStats,
}

impl MetricQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            stats: QueueStats::default(),
        }
    }

    /// Append a metric. Always succeeds; a full queue evicts its oldest entry.
    pub fn offer(&self, metric: Metric) {
        let evicted = {
            let mut inner = self.inner.lock();
            let evicted = if inner.len() >= self.capacity {
                inner.pop_front()
            } else {
                None
            };
            inner.push_back(metric);
            evicted
        };

        self.stats.offered.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = evicted {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                impression_id = %old.impression_id,
                capacity = self.capacity,
                "Metric queue full, dropped oldest metric"
            );
        }
    }

    /// Remove and return up to `max` metrics from the head.
    pub fn poll(&self, max: usize) -> Vec<Metric> {
        let batch: Vec<Metric> = {
            let mut inner = self.inner.lock();
            let n = max.min(inner.len());
            inner.drain(..n).collect()
        };
        self.stats
            .polled
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Re-offer a batch whose send failed.
    pub fn rollback(&self, metrics: Vec<Metric>) {
        let n = metrics.len();
        for metric in metrics {
            self.offer(metric);
        }
        self.stats.rolled_back.fetch_add(n as u64, Ordering::Relaxed);
        debug!(count = n, "Rolled back metrics");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }
}
