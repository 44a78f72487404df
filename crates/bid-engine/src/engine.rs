//! Engine context: every component built once from the configuration and
//! wired together by explicit constructor arguments.

use std::sync::Arc;
use std::time::Duration;

use bid_common::{PlacementKey, PrivacySignals, Publisher};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::BidApi;
use crate::cache::{BidCache, CacheStatsSnapshot, CachedBid};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::csm::{Metric, MetricConsumer, MetricQueue, QueueStatsSnapshot};
use crate::fetch::{FetchBatch, FetchExecutor, FetchOutcome, RequestContext};
use crate::lifecycle::{
    BidLifecycleListener, CompositeListener, CsmBidLifecycleListener, LoggingBidLifecycleListener,
};
use crate::scheduler::{BidDecision, BidScheduler, PlacementState};
use crate::state::{ConfigDelta, EngineCounters, EngineCountersSnapshot, FetchSettings, GlobalFetchState};
use crate::tracker::InFlightTracker;

/// Bid engine facade.
pub struct BidEngine {
    config: EngineConfig,
    cache: Arc<BidCache>,
    tracker: InFlightTracker,
    state: Arc<GlobalFetchState>,
    counters: Arc<EngineCounters>,
    context: Arc<RequestContext>,
    queue: Arc<MetricQueue>,
    executor: FetchExecutor,
    scheduler: BidScheduler,
    consumer: Arc<MetricConsumer>,
    runtime: Handle,
    shutdown_tx: broadcast::Sender<()>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl BidEngine {
    /// Build an engine on the system clock.
    pub fn new(config: EngineConfig, api: Arc<dyn BidApi>, runtime: Handle) -> Self {
        Self::with_parts(config, api, Arc::new(SystemClock), Vec::new(), runtime)
    }

    /// Build an engine with an explicit clock and extra lifecycle listeners.
    ///
    /// The logging and metrics listeners are always installed first.
    pub fn with_parts(
        config: EngineConfig,
        api: Arc<dyn BidApi>,
        clock: Arc<dyn Clock>,
        extra_listeners: Vec<Arc<dyn BidLifecycleListener>>,
        runtime: Handle,
    ) -> Self {
        let cache = Arc::new(BidCache::new(clock.clone()));
        let tracker = InFlightTracker::new();
        let state = Arc::new(GlobalFetchState::new(
            FetchSettings::initial(config.csm.enabled, config.csm.batch_size),
            clock.clone(),
        ));
        let counters = Arc::new(EngineCounters::new());
        let queue = Arc::new(MetricQueue::new(config.csm.max_queue_size));
        let context = Arc::new(RequestContext::new(
            Publisher {
                publisher_id: config.publisher.publisher_id.clone(),
                bundle_id: config.publisher.bundle_id.clone(),
            },
            config.publisher.sdk_version.clone(),
            config.publisher.profile_id,
        ));

        let mut listener = CompositeListener::new(vec![
            Arc::new(LoggingBidLifecycleListener),
            Arc::new(CsmBidLifecycleListener::new(queue.clone(), state.clone())),
        ]);
        for extra in extra_listeners {
            listener.push(extra);
        }
        let listener: Arc<dyn BidLifecycleListener> = Arc::new(listener);

        let executor = FetchExecutor::new(
            api.clone(),
            cache.clone(),
            state.clone(),
            counters.clone(),
            listener.clone(),
            context.clone(),
            clock.clone(),
            runtime.clone(),
        );
        let scheduler = BidScheduler::new(
            cache.clone(),
            tracker.clone(),
            state.clone(),
            executor.clone(),
            counters.clone(),
            listener,
            clock,
        );
        scheduler.register_placements(config.placements.iter().cloned());

        let consumer = Arc::new(MetricConsumer::new(
            queue.clone(),
            api,
            state.clone(),
            config.publisher.sdk_version.clone(),
            config.publisher.profile_id,
            runtime.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            cache,
            tracker,
            state,
            counters,
            context,
            queue,
            executor,
            scheduler,
            consumer,
            runtime,
            shutdown_tx,
            flush_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &BidScheduler {
        &self.scheduler
    }

    /// Bid for `key`, or `None`. Never blocks and never fails.
    pub fn request_bid(&self, key: &PlacementKey) -> Option<CachedBid> {
        self.scheduler.request_bid(key)
    }

    pub fn decide(&self, key: &PlacementKey) -> BidDecision {
        self.scheduler.decide(key)
    }

    /// Bid for `key`, waiting up to `timeout` for a fetch on a miss.
    pub async fn request_bid_or_wait(&self, key: &PlacementKey, timeout: Duration) -> Option<CachedBid> {
        self.scheduler.request_bid_or_wait(key, timeout).await
    }

    pub fn register_placements(&self, keys: impl IntoIterator<Item = PlacementKey>) {
        self.scheduler.register_placements(keys);
    }

    /// Fetch the remote config, then bids for every registered placement.
    pub fn prefetch_registered(&self) -> Option<oneshot::Receiver<FetchOutcome>> {
        let keys = self.scheduler.registered_placements();
        info!(placements = keys.len(), "Prefetching registered placements");
        self.scheduler.prefetch(&keys, true)
    }

    /// Fetch only the remote config. Not blocked by the kill switch.
    pub fn refresh_config(&self) -> oneshot::Receiver<FetchOutcome> {
        self.executor.submit(FetchBatch::config_only())
    }

    /// Apply a config delta directly.
    pub fn on_config_refresh(&self, delta: &ConfigDelta) -> Arc<FetchSettings> {
        self.scheduler.on_config_refresh(delta)
    }

    pub fn set_privacy(&self, privacy: PrivacySignals) {
        self.context.set_privacy(privacy);
    }

    pub fn set_device(&self, device_id: Option<String>, device_os: Option<String>, device_model: Option<String>) {
        self.context.set_device(device_id, device_os, device_model);
    }

    /// Queue a metric for the next send.
    pub fn report_metric(&self, metric: Metric) {
        self.queue.offer(metric);
    }

    /// Send one metrics batch now.
    pub fn send_metrics(&self) -> Option<JoinHandle<()>> {
        self.consumer.send_metric_batch()
    }

    /// Start the periodic metrics flush. Calling it again is a no-op.
    pub fn start_metric_flush(&self) {
        let mut task = self.flush_task.lock();
        if task.is_some() {
            return;
        }
        let consumer = self.consumer.clone();
        let period = self.config.csm.flush_interval;
        let shutdown = self.shutdown_tx.subscribe();
        *task = Some(self.runtime.spawn(consumer.run(period, shutdown)));
    }

    /// Stop the flush loop after a final metrics send.
    pub async fn shutdown(&self) {
        let task = self.flush_task.lock().take();
        match task {
            Some(task) => {
                let _ = self.shutdown_tx.send(());
                if let Err(e) = task.await {
                    warn!(error = %e, "Metric flush task ended abnormally");
                }
            }
            None => {
                if let Some(send) = self.send_metrics() {
                    let _ = send.await;
                }
            }
        }

        let counters = self.counters.snapshot();
        info!(
            bid_requests = counters.bid_requests,
            bids_served = counters.bids_served,
            fetches_started = counters.fetches_started,
            fetches_failed = counters.fetches_failed,
            pending_metrics = self.queue.len(),
            "Bid engine stopped"
        );
    }

    pub fn placement_state(&self, key: &PlacementKey) -> PlacementState {
        self.scheduler.placement_state(key)
    }

    pub fn is_in_flight(&self, key: &PlacementKey) -> bool {
        self.tracker.is_in_flight(key)
    }

    pub fn settings(&self) -> Arc<FetchSettings> {
        self.state.snapshot()
    }

    pub fn counters(&self) -> EngineCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStatsSnapshot {
        self.cache.stats()
    }

    pub fn queue_stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    pub fn pending_metrics(&self) -> usize {
        self.queue.len()
    }

    /// Watch that ticks once per finished fetch batch.
    pub fn subscribe_completions(&self) -> tokio::sync::watch::Receiver<u64> {
        self.executor.subscribe_completions()
    }
}
