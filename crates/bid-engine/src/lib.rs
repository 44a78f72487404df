//! Client-side bid cache and sync engine for an in-app bidding SDK.
//!
//! For each ad placement the engine decides whether a cached bid can be
//! served now, must be refreshed from the bidding backend, or must be
//! suppressed (backend "no bid", silent mode, kill switch).
//!
//! ## Architecture
//!
//! - **Lazy-evicting cache**: TTL checks and single-use pops happen at read
//!   time under the per-key DashMap lock
//! - **Deduplicated fetches**: at most one fetch in flight per placement,
//!   claims released by RAII guard on every exit path
//! - **Whole-struct config swap**: kill switch and cooldown change atomically
//! - **At-least-once metrics**: destructive poll, rollback on failed send
//!
//! ## Modules
//!
//! - `cache`: Bid cache with TTL validity rules
//! - `tracker`: In-flight claims per placement
//! - `fetch`: Fetch executor (one backend round trip per batch)
//! - `scheduler`: Per-placement bid state machine
//! - `csm`: Client-side metrics queue and consumer
//! - `engine`: Facade wiring everything from an `EngineConfig`

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod csm;
pub mod engine;
pub mod fetch;
pub mod lifecycle;
pub mod preconditions;
pub mod scheduler;
pub mod state;
pub mod tracker;

pub use api::{ApiError, BidApi, HttpBidApi, ScriptedBidApi};
pub use cache::{BidCache, CacheStatsSnapshot, CachedBid};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use csm::{Metric, MetricBuilder, MetricConsumer, MetricQueue, MetricRequest};
pub use engine::BidEngine;
pub use fetch::{FetchBatch, FetchExecutor, FetchOutcome, RequestContext};
pub use lifecycle::{
    BatchInfo, BidLifecycleListener, CompositeListener, CsmBidLifecycleListener, FetchFailure,
    LoggingBidLifecycleListener, NoopListener, SlotInfo,
};
pub use scheduler::{BidDecision, BidScheduler, PlacementState, RefreshOutcome};
pub use state::{ConfigDelta, EngineCounters, EngineCountersSnapshot, FetchSettings, GlobalFetchState};
pub use tracker::{InFlightClaim, InFlightTracker};
