//! Bid lifecycle hooks.
//!
//! The fetch executor and the scheduler report fetch start/finish/failure
//! and bid consumption to a [`BidLifecycleListener`]. Implementations here
//! log the events or turn them into client-side metrics.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bid_common::PlacementKey;
use tracing::{debug, info, warn};

use crate::cache::CachedBid;
use crate::csm::{Metric, MetricQueue};
use crate::state::GlobalFetchState;

/// One placement of a batch with the impression id it was requested under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub key: PlacementKey,
    pub impression_id: String,
}

/// A batch as seen by the listeners.
#[derive(Debug, Clone)]
pub struct BatchInfo {
    pub request_id: String,
    pub slots: Vec<SlotInfo>,
    pub started_at_ms: i64,
}

/// Why a fetch produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    Network(String),
    Panicked,
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::Network(e) => write!(f, "network: {}", e),
            FetchFailure::Panicked => write!(f, "panicked"),
        }
    }
}

pub trait BidLifecycleListener: Send + Sync {
    fn on_fetch_started(&self, _batch: &BatchInfo) {}

    /// `stored` lists the placements that received a bid.
    fn on_fetch_finished(&self, _batch: &BatchInfo, _finished_at_ms: i64, _stored: &[PlacementKey]) {}

    fn on_fetch_failed(&self, _batch: &BatchInfo, _failed_at_ms: i64, _failure: &FetchFailure) {}

    fn on_bid_consumed(&self, _key: &PlacementKey, _bid: &CachedBid, _consumed_at_ms: i64) {}
}

/// Listener that does nothing.
#[derive(Debug, Default)]
pub struct NoopListener;

impl BidLifecycleListener for NoopListener {}

#[derive(Debug, Default)]
pub struct LoggingBidLifecycleListener;

impl BidLifecycleListener for LoggingBidLifecycleListener {
    fn on_fetch_started(&self, batch: &BatchInfo) {
        info!(
            request_id = %batch.request_id,
            batch_size = batch.slots.len(),
            "Bid fetch started"
        );
    }

    fn on_fetch_finished(&self, batch: &BatchInfo, finished_at_ms: i64, stored: &[PlacementKey]) {
        info!(
            request_id = %batch.request_id,
            batch_size = batch.slots.len(),
            stored = stored.len(),
            latency_ms = finished_at_ms - batch.started_at_ms,
            "Bid fetch finished"
        );
    }

    fn on_fetch_failed(&self, batch: &BatchInfo, _failed_at_ms: i64, failure: &FetchFailure) {
        warn!(
            request_id = %batch.request_id,
            batch_size = batch.slots.len(),
            failure = %failure,
            "Bid fetch failed"
        );
    }

    fn on_bid_consumed(&self, key: &PlacementKey, bid: &CachedBid, _consumed_at_ms: i64) {
        debug!(placement = %key, impression_id = %bid.impression_id, cpm = %bid.cpm, "Bid consumed");
    }
}

/// Turns lifecycle events into metrics offered to the queue.
///
/// Nothing is recorded while the remote config has metrics disabled.
pub struct CsmBidLifecycleListener {
    queue: Arc<MetricQueue>,
    state: Arc<GlobalFetchState>,
}

impl CsmBidLifecycleListener {
    pub fn new(queue: Arc<MetricQueue>, state: Arc<GlobalFetchState>) -> Self {
        Self { queue, state }
    }

    fn enabled(&self) -> bool {
        self.state.snapshot().csm_enabled
    }
}

impl BidLifecycleListener for CsmBidLifecycleListener {
    fn on_fetch_finished(&self, batch: &BatchInfo, finished_at_ms: i64, _stored: &[PlacementKey]) {
        if !self.enabled() {
            return;
        }
        for slot in &batch.slots {
            self.queue.offer(
                Metric::builder(slot.impression_id.clone())
                    .placement_id(slot.key.placement_id())
                    .cdb_call_start(batch.started_at_ms)
                    .cdb_call_end(finished_at_ms)
                    .build(),
            );
        }
    }

    fn on_fetch_failed(&self, batch: &BatchInfo, _failed_at_ms: i64, failure: &FetchFailure) {
        if !self.enabled() {
            return;
        }
        for slot in &batch.slots {
            let builder = Metric::builder(slot.impression_id.clone())
                .placement_id(slot.key.placement_id())
                .cdb_call_start(batch.started_at_ms);
            let builder = match failure {
                FetchFailure::Timeout => builder.timeout(),
                FetchFailure::Network(_) | FetchFailure::Panicked => builder.network_exception(),
            };
            self.queue.offer(builder.build());
        }
    }

    fn on_bid_consumed(&self, key: &PlacementKey, bid: &CachedBid, consumed_at_ms: i64) {
        if !self.enabled() {
            return;
        }
        self.queue.offer(
            Metric::builder(bid.impression_id.clone())
                .placement_id(key.placement_id())
                .elapsed(consumed_at_ms - bid.downloaded_at_ms)
                .build(),
        );
    }
}

/// Fans every event out to several listeners, in order.
///
/// A panicking listener is logged and skipped; the others still run and the
/// panic never reaches the caller of the hook.
#[derive(Default)]
pub struct CompositeListener {
    listeners: Vec<Arc<dyn BidLifecycleListener>>,
}

impl CompositeListener {
    pub fn new(listeners: Vec<Arc<dyn BidLifecycleListener>>) -> Self {
        Self { listeners }
    }

    pub fn push(&mut self, listener: Arc<dyn BidLifecycleListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    fn dispatch(&self, hook: &'static str, call: impl Fn(&dyn BidLifecycleListener)) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| call(listener.as_ref()))).is_err() {
                warn!(hook, "Lifecycle listener panicked");
            }
        }
    }
}

impl BidLifecycleListener for CompositeListener {
    fn on_fetch_started(&self, batch: &BatchInfo) {
        self.dispatch("on_fetch_started", |listener| listener.on_fetch_started(batch));
    }

    fn on_fetch_finished(&self, batch: &BatchInfo, finished_at_ms: i64, stored: &[PlacementKey]) {
        self.dispatch("on_fetch_finished", |listener| {
            listener.on_fetch_finished(batch, finished_at_ms, stored)
        });
    }

    fn on_fetch_failed(&self, batch: &BatchInfo, failed_at_ms: i64, failure: &FetchFailure) {
        self.dispatch("on_fetch_failed", |listener| {
            listener.on_fetch_failed(batch, failed_at_ms, failure)
        });
    }

    fn on_bid_consumed(&self, key: &PlacementKey, bid: &CachedBid, consumed_at_ms: i64) {
        self.dispatch("on_bid_consumed", |listener| {
            listener.on_bid_consumed(key, bid, consumed_at_ms)
        });
    }
}
