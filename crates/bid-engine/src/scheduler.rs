//! Bid scheduler - decides hit, miss or suppression for each bid request.
//!
//! ```text
//! request_bid(K)
//!   ├─ silent mode active ─────────────► no bid      (SUPPRESSED_COOLDOWN)
//!   ├─ valid bid cached, CPM > 0 ──────► bid + prefetch K (CACHED_VALID)
//!   ├─ valid bid cached, CPM = 0 ──────► no bid, no fetch (SUPPRESSED_COOLDOWN)
//!   ├─ kill switch engaged ────────────► no bid      (NO_REQUEST)
//!   └─ miss ─► claim K ─► submit batch ► no bid      (AWAITING_FETCH)
//!                 └─ already claimed ──► no bid      (AWAITING_FETCH)
//! ```
//!
//! A miss never waits for the network; the fetch only benefits later calls.
//! `request_bid_or_wait` is the exception for callers that must wait.

use std::sync::Arc;
use std::time::Duration;

use bid_common::PlacementKey;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::debug;

use crate::cache::{BidCache, CachedBid};
use crate::clock::Clock;
use crate::fetch::{FetchBatch, FetchExecutor, FetchOutcome};
use crate::lifecycle::BidLifecycleListener;
use crate::state::{ConfigDelta, EngineCounters, FetchSettings, GlobalFetchState};
use crate::tracker::InFlightTracker;

/// Per-placement scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementState {
    /// Nothing cached, nothing pending.
    NoRequest,
    /// A servable bid is cached.
    CachedValid,
    /// A fetch for the placement is in flight.
    AwaitingFetch,
    /// Silent mode: global cooldown or a cached zero-CPM bid.
    SuppressedCooldown,
}

/// Result of one bid request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BidDecision {
    pub state: PlacementState,
    /// Bid to serve. Never a zero-CPM bid.
    pub bid: Option<CachedBid>,
}

impl BidDecision {
    fn no_bid(state: PlacementState) -> Self {
        Self { state, bid: None }
    }
}

/// Result of asking for a background refresh.
#[derive(Debug)]
pub enum RefreshOutcome {
    Submitted(oneshot::Receiver<FetchOutcome>),
    InFlight,
    KillSwitch,
}

enum Lookup {
    Serve(CachedBid),
    NoBid,
    Miss,
}

pub struct BidScheduler {
    cache: Arc<BidCache>,
    tracker: InFlightTracker,
    state: Arc<GlobalFetchState>,
    executor: FetchExecutor,
    counters: Arc<EngineCounters>,
    listener: Arc<dyn BidLifecycleListener>,
    clock: Arc<dyn Clock>,
    registered: RwLock<Vec<PlacementKey>>,
}

impl BidScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<BidCache>,
        tracker: InFlightTracker,
        state: Arc<GlobalFetchState>,
        executor: FetchExecutor,
        counters: Arc<EngineCounters>,
        listener: Arc<dyn BidLifecycleListener>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            tracker,
            state,
            executor,
            counters,
            listener,
            clock,
            registered: RwLock::new(Vec::new()),
        }
    }

    /// Register placements that ride along with any batch.
    pub fn register_placements(&self, keys: impl IntoIterator<Item = PlacementKey>) {
        let mut registered = self.registered.write();
        for key in keys {
            if !registered.contains(&key) {
                registered.push(key);
            }
        }
    }

    pub fn registered_placements(&self) -> Vec<PlacementKey> {
        self.registered.read().clone()
    }

    /// Bid to serve for `key`, or `None`. Never blocks on the network.
    pub fn request_bid(&self, key: &PlacementKey) -> Option<CachedBid> {
        self.decide(key).bid
    }

    /// Run the state machine for one request.
    pub fn decide(&self, key: &PlacementKey) -> BidDecision {
        EngineCounters::inc(&self.counters.bid_requests);

        if self.state.is_cooling_down() {
            EngineCounters::inc(&self.counters.suppressed_cooldown);
            debug!(placement = %key, "Silent mode, no bid");
            return BidDecision::no_bid(PlacementState::SuppressedCooldown);
        }

        match self.lookup(key) {
            Lookup::Serve(bid) => {
                // Best-effort prefetch so the next call finds fresh data
                self.refresh(key);
                BidDecision {
                    state: PlacementState::CachedValid,
                    bid: Some(bid),
                }
            }
            Lookup::NoBid => BidDecision::no_bid(PlacementState::SuppressedCooldown),
            Lookup::Miss => match self.refresh(key) {
                RefreshOutcome::Submitted(_) | RefreshOutcome::InFlight => {
                    BidDecision::no_bid(PlacementState::AwaitingFetch)
                }
                RefreshOutcome::KillSwitch => BidDecision::no_bid(PlacementState::NoRequest),
            },
        }
    }

    /// Like `request_bid`, but on a miss waits up to `timeout` for the fetch
    /// covering `key` to finish and reads the cache again.
    pub async fn request_bid_or_wait(&self, key: &PlacementKey, timeout: Duration) -> Option<CachedBid> {
        // Subscribe before deciding so the completion cannot be missed
        let mut completions = self.executor.subscribe_completions();

        let decision = self.decide(key);
        if decision.state != PlacementState::AwaitingFetch {
            return decision.bid;
        }

        let waited = tokio::time::timeout(timeout, async {
            while self.tracker.is_in_flight(key) {
                if completions.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if waited.is_err() {
            debug!(placement = %key, timeout_ms = timeout.as_millis() as u64, "Wait for bid timed out");
            return None;
        }

        match self.lookup(key) {
            Lookup::Serve(bid) => Some(bid),
            Lookup::NoBid | Lookup::Miss => None,
        }
    }

    /// Ask for a background refresh of `key`, deduplicated and subject to the
    /// kill switch. Registered placements without a servable bid join the batch.
    pub fn refresh(&self, key: &PlacementKey) -> RefreshOutcome {
        if self.state.kill_switch_engaged() {
            EngineCounters::inc(&self.counters.suppressed_kill_switch);
            debug!(placement = %key, "Kill switch engaged, no fetch");
            return RefreshOutcome::KillSwitch;
        }

        let Some(claim) = self.tracker.try_claim_guarded(key) else {
            EngineCounters::inc(&self.counters.fetches_deduplicated);
            debug!(placement = %key, "Fetch already in flight");
            return RefreshOutcome::InFlight;
        };

        let mut claims = vec![claim];
        for other in self.registered.read().iter() {
            if other == key || self.cache.is_servable(other) {
                continue;
            }
            if let Some(claim) = self.tracker.try_claim_guarded(other) {
                claims.push(claim);
            }
        }

        debug!(placement = %key, batch_size = claims.len(), "Submitting fetch batch");
        RefreshOutcome::Submitted(self.executor.submit(FetchBatch::new(claims)))
    }

    /// Fetch every given placement not already in flight in one batch.
    ///
    /// With `with_config`, the remote config is requested first; the batch is
    /// then sent even if nothing could be claimed, so the config is refreshed.
    pub fn prefetch(&self, keys: &[PlacementKey], with_config: bool) -> Option<oneshot::Receiver<FetchOutcome>> {
        if !with_config && self.state.kill_switch_engaged() {
            EngineCounters::inc(&self.counters.suppressed_kill_switch);
            return None;
        }

        let claims: Vec<_> = keys
            .iter()
            .filter_map(|key| self.tracker.try_claim_guarded(key))
            .collect();
        if claims.is_empty() && !with_config {
            return None;
        }

        let batch = FetchBatch::new(claims);
        let batch = if with_config { batch.with_config() } else { batch };
        Some(self.executor.submit(batch))
    }

    /// Apply a config delta (kill switch, cooldown, metrics settings).
    pub fn on_config_refresh(&self, delta: &ConfigDelta) -> Arc<FetchSettings> {
        self.state.apply(delta)
    }

    /// Current state of `key`, without side effects.
    pub fn placement_state(&self, key: &PlacementKey) -> PlacementState {
        if self.state.is_cooling_down() {
            PlacementState::SuppressedCooldown
        } else if self.tracker.is_in_flight(key) {
            PlacementState::AwaitingFetch
        } else if self.cache.is_servable(key) {
            PlacementState::CachedValid
        } else {
            PlacementState::NoRequest
        }
    }

    /// Read the cache and translate zero-CPM bids into "no bid".
    fn lookup(&self, key: &PlacementKey) -> Lookup {
        match self.cache.get(key) {
            None => Lookup::Miss,
            Some(bid) if bid.is_no_bid() => {
                if bid.is_single_use() {
                    // Popped by the lookup; nothing suppresses a refetch
                    Lookup::Miss
                } else {
                    EngineCounters::inc(&self.counters.suppressed_no_bid);
                    debug!(placement = %key, "Cached no-bid, placement silent");
                    Lookup::NoBid
                }
            }
            Some(bid) => {
                EngineCounters::inc(&self.counters.bids_served);
                self.listener
                    .on_bid_consumed(key, &bid, self.clock.now_ms());
                Lookup::Serve(bid)
            }
        }
    }
}
