//! Fetch executor - one backend round trip per batch.
//!
//! ```text
//! Scheduler ──► FetchBatch (owns InFlightClaims) ──► spawned task
//!                                                       │
//!              [config call] ─► [bid call] ─► cache + config delta
//!                                                       │
//!              claims dropped (released) ◄──────────────┘
//! ```
//!
//! A batch owns the in-flight claims of its placements. They are dropped when
//! the task ends, after the cache and the fetch state have been updated, so a
//! caller that sees a placement leave the in-flight set also sees its bid.
//! The task body runs under `catch_unwind`; a panic is reported as a failed
//! fetch and the claims are still released by unwinding.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bid_common::{
    CdbRequest, CdbRequestSlot, CdbResponse, PlacementKey, PrivacySignals, Publisher,
    RemoteConfigRequest, UserContext,
};
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::BidApi;
use crate::cache::{BidCache, CachedBid};
use crate::clock::Clock;
use crate::lifecycle::{BatchInfo, BidLifecycleListener, FetchFailure, SlotInfo};
use crate::state::{ConfigDelta, EngineCounters, GlobalFetchState};
use crate::tracker::InFlightClaim;

/// Identity and device context attached to every request.
#[derive(Debug)]
pub struct RequestContext {
    pub publisher: Publisher,
    pub sdk_version: String,
    pub profile_id: i32,
    user: RwLock<UserContext>,
}

impl RequestContext {
    pub fn new(publisher: Publisher, sdk_version: String, profile_id: i32) -> Self {
        Self {
            publisher,
            sdk_version,
            profile_id,
            user: RwLock::new(UserContext::default()),
        }
    }

    /// Replace the privacy signals sent with later requests.
    pub fn set_privacy(&self, privacy: PrivacySignals) {
        self.user.write().privacy = privacy;
    }

    pub fn set_device(&self, device_id: Option<String>, device_os: Option<String>, device_model: Option<String>) {
        let mut user = self.user.write();
        user.device_id = device_id;
        user.device_os = device_os;
        user.device_model = device_model;
    }

    pub fn user(&self) -> UserContext {
        self.user.read().clone()
    }

    fn bid_request(&self, slots: &[SlotInfo]) -> CdbRequest {
        let user = self.user();
        CdbRequest {
            id: Uuid::new_v4().to_string(),
            publisher: self.publisher.clone(),
            gdpr_consent: user.privacy.gdpr.clone(),
            user,
            sdk_version: self.sdk_version.clone(),
            profile_id: self.profile_id,
            slots: slots
                .iter()
                .map(|slot| CdbRequestSlot::for_key(&slot.key, slot.impression_id.clone()))
                .collect(),
        }
    }

    fn config_request(&self) -> RemoteConfigRequest {
        RemoteConfigRequest {
            publisher_id: self.publisher.publisher_id.clone(),
            bundle_id: self.publisher.bundle_id.clone(),
            sdk_version: self.sdk_version.clone(),
            profile_id: self.profile_id,
        }
    }
}

/// A set of claimed placements to fetch together.
#[derive(Debug, Default)]
pub struct FetchBatch {
    claims: Vec<InFlightClaim>,
    with_config: bool,
}

impl FetchBatch {
    pub fn new(claims: Vec<InFlightClaim>) -> Self {
        Self {
            claims,
            with_config: false,
        }
    }

    /// A batch that only refreshes the remote config.
    pub fn config_only() -> Self {
        Self {
            claims: Vec::new(),
            with_config: true,
        }
    }

    /// Request the remote config before the bids.
    pub fn with_config(mut self) -> Self {
        self.with_config = true;
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &PlacementKey> {
        self.claims.iter().map(InFlightClaim::key)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Bid call answered; `stored` bids were cached.
    Completed { stored: usize },
    /// Only the remote config was requested.
    ConfigRefreshed,
    /// Kill switch engaged; no bid call made.
    KillSwitch,
    /// Profile id not positive; nothing sent.
    InvalidProfile,
    Failed(FetchFailure),
}

struct ExecutorInner {
    api: Arc<dyn BidApi>,
    cache: Arc<BidCache>,
    state: Arc<GlobalFetchState>,
    counters: Arc<EngineCounters>,
    listener: Arc<dyn BidLifecycleListener>,
    context: Arc<RequestContext>,
    clock: Arc<dyn Clock>,
    completions: watch::Sender<u64>,
}

/// Runs fetch batches on the runtime.
#[derive(Clone)]
pub struct FetchExecutor {
    inner: Arc<ExecutorInner>,
    runtime: Handle,
}

impl FetchExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn BidApi>,
        cache: Arc<BidCache>,
        state: Arc<GlobalFetchState>,
        counters: Arc<EngineCounters>,
        listener: Arc<dyn BidLifecycleListener>,
        context: Arc<RequestContext>,
        clock: Arc<dyn Clock>,
        runtime: Handle,
    ) -> Self {
        let (completions, _) = watch::channel(0);
        Self {
            inner: Arc::new(ExecutorInner {
                api,
                cache,
                state,
                counters,
                listener,
                context,
                clock,
                completions,
            }),
            runtime,
        }
    }

    /// Watch that ticks once per finished batch, whatever the outcome.
    pub fn subscribe_completions(&self) -> watch::Receiver<u64> {
        self.inner.completions.subscribe()
    }

    /// Run the batch in the background.
    ///
    /// The receiver yields the outcome. Dropping it does not cancel the batch.
    pub fn submit(&self, batch: FetchBatch) -> oneshot::Receiver<FetchOutcome> {
        let (tx, rx) = oneshot::channel();
        let inner = self.inner.clone();

        let info = BatchInfo {
            request_id: Uuid::new_v4().to_string(),
            slots: batch
                .keys()
                .map(|key| SlotInfo {
                    key: key.clone(),
                    impression_id: Uuid::new_v4().simple().to_string(),
                })
                .collect(),
            started_at_ms: inner.clock.now_ms(),
        };

        self.runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(run_batch(&inner, batch, &info))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    EngineCounters::inc(&inner.counters.fetches_failed);
                    warn!(request_id = %info.request_id, "Fetch task panicked");
                    let failed_at_ms = inner.clock.now_ms();
                    let listener = inner.listener.clone();
                    let _ = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        listener.on_fetch_failed(&info, failed_at_ms, &FetchFailure::Panicked)
                    }));
                    FetchOutcome::Failed(FetchFailure::Panicked)
                }
            };

            inner.completions.send_modify(|generation| *generation += 1);
            let _ = tx.send(outcome);
        });

        rx
    }
}

async fn run_batch(inner: &ExecutorInner, batch: FetchBatch, info: &BatchInfo) -> FetchOutcome {
    let context = &inner.context;

    if context.profile_id <= 0 {
        warn!(profile_id = context.profile_id, "Invalid profile id, batch not sent");
        return FetchOutcome::InvalidProfile;
    }

    if batch.with_config {
        match inner.api.fetch_config(&context.config_request()).await {
            Ok(config) => {
                inner.state.apply(&ConfigDelta::from_remote(&config));
            }
            Err(e) => warn!(error = %e, "Remote config fetch failed"),
        }
    }

    if batch.is_empty() {
        return FetchOutcome::ConfigRefreshed;
    }

    if inner.state.kill_switch_engaged() {
        EngineCounters::inc(&inner.counters.suppressed_kill_switch);
        info!(batch_size = batch.len(), "Kill switch engaged, bid call skipped");
        return FetchOutcome::KillSwitch;
    }

    let request = context.bid_request(&info.slots);
    EngineCounters::inc(&inner.counters.fetches_started);
    inner.listener.on_fetch_started(info);
    debug!(request_id = %info.request_id, batch_size = batch.len(), "Sending bid request");

    let outcome = match inner.api.fetch_bids(&request).await {
        Ok(response) => {
            let stored = store_response(inner, &response, info);
            inner.state.apply(&ConfigDelta::from_response(&response));
            inner
                .listener
                .on_fetch_finished(info, inner.clock.now_ms(), &stored);
            FetchOutcome::Completed {
                stored: stored.len(),
            }
        }
        Err(e) => {
            let failure = if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Network(e.to_string())
            };
            EngineCounters::inc(&inner.counters.fetches_failed);
            warn!(request_id = %info.request_id, error = %e, "Bid request failed");
            inner
                .listener
                .on_fetch_failed(info, inner.clock.now_ms(), &failure);
            FetchOutcome::Failed(failure)
        }
    };

    // Claims are released only now, after the cache is populated.
    drop(batch);
    outcome
}

/// Decode the response and cache every slot that answers a requested placement.
fn store_response(inner: &ExecutorInner, response: &CdbResponse, info: &BatchInfo) -> Vec<PlacementKey> {
    let (slots, errors) = response.decode_slots();

    for error in &errors {
        warn!(request_id = %info.request_id, error = %error, "Dropping malformed slot");
    }
    EngineCounters::add(&inner.counters.malformed_slots, errors.len() as u64);

    let downloaded_at_ms = inner.clock.now_ms();
    let mut stored = Vec::with_capacity(slots.len());

    for slot in slots {
        let requested = slot
            .imp_id
            .as_deref()
            .and_then(|imp_id| info.slots.iter().find(|s| s.impression_id == imp_id))
            .or_else(|| info.slots.iter().find(|s| slot.matches(&s.key)));

        let Some(requested) = requested else {
            warn!(
                placement_id = %slot.placement_id,
                size = %slot.size,
                "Slot answers no requested placement, ignored"
            );
            continue;
        };

        let bid = CachedBid::from_slot(slot, requested.impression_id.clone(), downloaded_at_ms);
        debug!(
            placement = %requested.key,
            cpm = %bid.cpm,
            ttl_secs = bid.ttl_secs,
            "Caching bid"
        );
        inner.cache.put(requested.key.clone(), bid);
        stored.push(requested.key.clone());
    }

    EngineCounters::add(&inner.counters.bids_stored, stored.len() as u64);
    stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ScriptedBidApi;
    use crate::api::scripted::Reply;
    use crate::clock::ManualClock;
    use crate::lifecycle::NoopListener;
    use crate::state::FetchSettings;
    use crate::tracker::InFlightTracker;
    use bid_common::{CdbSlot, CreativePayload, RemoteConfig};
    use rust_decimal_macros::dec;
    use serde_json::json;

    struct Fixture {
        api: Arc<ScriptedBidApi>,
        cache: Arc<BidCache>,
        state: Arc<GlobalFetchState>,
        counters: Arc<EngineCounters>,
        tracker: InFlightTracker,
        executor: FetchExecutor,
    }

    fn fixture_with_profile(api: ScriptedBidApi, profile_id: i32) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000));
        let api = Arc::new(api);
        let cache = Arc::new(BidCache::new(clock.clone()));
        let state = Arc::new(GlobalFetchState::new(
            FetchSettings::initial(true, 10),
            clock.clone(),
        ));
        let counters = Arc::new(EngineCounters::new());
        let context = Arc::new(RequestContext::new(
            Publisher {
                publisher_id: "B-000001".to_string(),
                bundle_id: "com.example.app".to_string(),
            },
            "1.0.0".to_string(),
            profile_id,
        ));
        let executor = FetchExecutor::new(
            api.clone(),
            cache.clone(),
            state.clone(),
            counters.clone(),
            Arc::new(NoopListener),
            context,
            clock,
            Handle::current(),
        );
        Fixture {
            api,
            cache,
            state,
            counters,
            tracker: InFlightTracker::new(),
            executor,
        }
    }

    fn fixture(api: ScriptedBidApi) -> Fixture {
        fixture_with_profile(api, 235)
    }

    fn claim(f: &Fixture, key: &PlacementKey) -> InFlightClaim {
        f.tracker.try_claim_guarded(key).unwrap()
    }

    fn slot(key: &PlacementKey, cpm: rust_decimal::Decimal, ttl_secs: u64) -> serde_json::Value {
        CdbSlot {
            imp_id: None,
            placement_id: key.placement_id().to_string(),
            size: key.size(),
            is_native: false,
            cpm,
            ttl_secs,
            payload: CreativePayload::DisplayUrl("https://cdn.example.com/ad.js".to_string()),
        }
        .to_wire()
    }

    #[tokio::test]
    async fn test_batch_stores_bids_and_releases_claims() {
        let f = fixture(ScriptedBidApi::auto_bidding(dec!(1.5), 60));
        let p1 = PlacementKey::banner("p1", 320, 50);
        let p2 = PlacementKey::banner("p2", 300, 250);

        let rx = f
            .executor
            .submit(FetchBatch::new(vec![claim(&f, &p1), claim(&f, &p2)]));
        assert_eq!(rx.await.unwrap(), FetchOutcome::Completed { stored: 2 });

        assert_eq!(f.api.bid_calls(), 1);
        assert_eq!(f.api.bid_requests()[0].slots.len(), 2);
        assert_eq!(f.cache.len(), 2);
        assert!(!f.tracker.is_in_flight(&p1));
        assert!(!f.tracker.is_in_flight(&p2));
        assert_eq!(f.counters.snapshot().bids_stored, 2);
        assert_eq!(f.counters.snapshot().fetches_started, 1);
    }

    #[tokio::test]
    async fn test_network_failure_releases_claims() {
        let f = fixture(ScriptedBidApi::new());
        f.api.push_bids(Reply::Unavailable);
        let p1 = PlacementKey::banner("p1", 320, 50);

        let outcome = f.executor.submit(FetchBatch::new(vec![claim(&f, &p1)])).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Failed(FetchFailure::Network(_))));
        assert!(!f.tracker.is_in_flight(&p1));
        assert!(f.cache.is_empty());
        assert_eq!(f.counters.snapshot().fetches_failed, 1);
    }

    #[tokio::test]
    async fn test_panic_releases_claims() {
        let f = fixture(ScriptedBidApi::new());
        f.api.push_bids(Reply::Panic);
        let p1 = PlacementKey::banner("p1", 320, 50);
        let mut completions = f.executor.subscribe_completions();

        let outcome = f.executor.submit(FetchBatch::new(vec![claim(&f, &p1)])).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Failed(FetchFailure::Panicked));
        assert!(!f.tracker.is_in_flight(&p1));
        assert!(completions.has_changed().unwrap());
        assert_eq!(*completions.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn test_malformed_slot_does_not_fail_batch() {
        let f = fixture(ScriptedBidApi::new());
        let p1 = PlacementKey::banner("p1", 320, 50);
        let p2 = PlacementKey::banner("p2", 320, 50);
        f.api.push_bids(Reply::Ok(CdbResponse {
            slots: vec![
                slot(&p1, dec!(2), 30),
                json!({ "placementId": "p2", "width": 320, "height": 50, "cpm": "NaN" }),
            ],
            ..Default::default()
        }));

        let outcome = f
            .executor
            .submit(FetchBatch::new(vec![claim(&f, &p1), claim(&f, &p2)]))
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Completed { stored: 1 });
        assert!(f.cache.contains(&p1));
        assert!(!f.cache.contains(&p2));
        assert_eq!(f.counters.snapshot().malformed_slots, 1);
        assert!(!f.tracker.is_in_flight(&p2));
    }

    #[tokio::test]
    async fn test_unrequested_slot_is_ignored() {
        let f = fixture(ScriptedBidApi::new());
        let p1 = PlacementKey::banner("p1", 320, 50);
        let other = PlacementKey::banner("other", 320, 50);
        f.api.push_bids(Reply::Ok(CdbResponse {
            slots: vec![slot(&other, dec!(2), 30)],
            ..Default::default()
        }));

        let outcome = f.executor.submit(FetchBatch::new(vec![claim(&f, &p1)])).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Completed { stored: 0 });
        assert!(f.cache.is_empty());
    }

    #[tokio::test]
    async fn test_response_config_is_applied() {
        let f = fixture(ScriptedBidApi::new());
        f.api.push_bids(Reply::Ok(CdbResponse {
            time_to_next_call: Some(30),
            config: Some(RemoteConfig {
                csm_batch_size: Some(7),
                ..Default::default()
            }),
            ..Default::default()
        }));
        let p1 = PlacementKey::banner("p1", 320, 50);

        f.executor.submit(FetchBatch::new(vec![claim(&f, &p1)])).await.unwrap();
        assert!(f.state.is_cooling_down());
        assert_eq!(f.state.snapshot().csm_batch_size, 7);
    }

    #[tokio::test]
    async fn test_config_first_kill_switch_skips_bid_call() {
        let f = fixture(ScriptedBidApi::auto_bidding(dec!(1), 60));
        f.api.push_config(Reply::Ok(RemoteConfig {
            kill_switch: Some(true),
            ..Default::default()
        }));
        let p1 = PlacementKey::banner("p1", 320, 50);

        let outcome = f
            .executor
            .submit(FetchBatch::new(vec![claim(&f, &p1)]).with_config())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::KillSwitch);
        assert_eq!(f.api.config_calls(), 1);
        assert_eq!(f.api.bid_calls(), 0);
        assert!(!f.tracker.is_in_flight(&p1));
        assert_eq!(f.counters.snapshot().suppressed_kill_switch, 1);
    }

    #[tokio::test]
    async fn test_config_failure_does_not_block_bids() {
        let f = fixture(ScriptedBidApi::auto_bidding(dec!(1), 60));
        f.api.push_config(Reply::Status(500));
        let p1 = PlacementKey::banner("p1", 320, 50);

        let outcome = f
            .executor
            .submit(FetchBatch::new(vec![claim(&f, &p1)]).with_config())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Completed { stored: 1 });
    }

    #[tokio::test]
    async fn test_config_only_batch() {
        let f = fixture(ScriptedBidApi::new());
        f.state.apply(&ConfigDelta {
            kill_switch: Some(true),
            ..Default::default()
        });
        f.api.push_config(Reply::Ok(RemoteConfig {
            kill_switch: Some(false),
            ..Default::default()
        }));

        let outcome = f.executor.submit(FetchBatch::config_only()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::ConfigRefreshed);
        assert!(!f.state.kill_switch_engaged());
        assert_eq!(f.api.bid_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_profile_sends_nothing() {
        let f = fixture_with_profile(ScriptedBidApi::auto_bidding(dec!(1), 60), 0);
        let p1 = PlacementKey::banner("p1", 320, 50);

        let outcome = f
            .executor
            .submit(FetchBatch::new(vec![claim(&f, &p1)]).with_config())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::InvalidProfile);
        assert_eq!(f.api.bid_calls(), 0);
        assert_eq!(f.api.config_calls(), 0);
        assert!(!f.tracker.is_in_flight(&p1));
    }

    #[tokio::test]
    async fn test_request_carries_privacy_and_impression_ids() {
        let f = fixture(ScriptedBidApi::auto_bidding(dec!(1), 0));
        f.executor.inner.context.set_privacy(PrivacySignals {
            us_privacy: Some("1YNN".to_string()),
            ..Default::default()
        });
        let p1 = PlacementKey::banner("p1", 320, 50);

        f.executor.submit(FetchBatch::new(vec![claim(&f, &p1)])).await.unwrap();

        let request = &f.api.bid_requests()[0];
        assert_eq!(request.user.privacy.us_privacy.as_deref(), Some("1YNN"));
        assert_eq!(request.profile_id, 235);
        let imp_id = &request.slots[0].imp_id;
        assert!(!imp_id.is_empty());
        assert_eq!(&f.cache.get(&p1).unwrap().impression_id, imp_id);
    }
}
