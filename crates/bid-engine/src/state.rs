//! Process-wide fetch state and counters.
//!
//! `GlobalFetchState` holds the remote-controlled settings (silent-mode
//! cooldown, kill switch, client-side metrics switches). A config delta is
//! applied by building a new `FetchSettings` under the write lock and
//! swapping the `Arc`, so readers see either the old or the new settings,
//! never a mix.
//!
//! `EngineCounters` are relaxed atomics; exact counts aren't critical.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bid_common::{CdbResponse, RemoteConfig};
use parking_lot::RwLock;
use tracing::info;

use crate::clock::Clock;

/// Remote-controlled settings, swapped as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    /// Silent mode: no bid traffic before this timestamp (ms since epoch).
    pub cooldown_until_ms: i64,
    /// Kill switch: no bid network calls while set.
    pub kill_switch: bool,
    /// Client-side metrics reporting enabled.
    pub csm_enabled: bool,
    /// Maximum metrics per send.
    pub csm_batch_size: u32,
}

impl FetchSettings {
    /// Settings at process start: no cooldown, kill switch off.
    pub fn initial(csm_enabled: bool, csm_batch_size: u32) -> Self {
        Self {
            cooldown_until_ms: 0,
            kill_switch: false,
            csm_enabled,
            csm_batch_size,
        }
    }

    #[inline]
    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        now_ms < self.cooldown_until_ms
    }
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self::initial(true, 10)
    }
}

/// Partial update of the fetch settings. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDelta {
    pub kill_switch: Option<bool>,
    pub cooldown_seconds: Option<u64>,
    pub csm_enabled: Option<bool>,
    pub csm_batch_size: Option<u32>,
}

impl ConfigDelta {
    pub fn from_remote(config: &RemoteConfig) -> Self {
        Self {
            kill_switch: config.kill_switch,
            cooldown_seconds: config.cooldown_seconds,
            csm_enabled: config.csm_enabled,
            csm_batch_size: config.csm_batch_size,
        }
    }

    /// Extract the config delta carried by a bid response.
    ///
    /// `time_to_next_call` stands in for the cooldown when the config object
    /// carries none.
    pub fn from_response(response: &CdbResponse) -> Self {
        let mut delta = response
            .config
            .as_ref()
            .map(Self::from_remote)
            .unwrap_or_default();
        if delta.cooldown_seconds.is_none() {
            delta.cooldown_seconds = response.time_to_next_call;
        }
        delta
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Process-wide fetch state.
pub struct GlobalFetchState {
    settings: RwLock<Arc<FetchSettings>>,
    clock: Arc<dyn Clock>,
}

impl GlobalFetchState {
    pub fn new(initial: FetchSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings: RwLock::new(Arc::new(initial)),
            clock,
        }
    }

    /// Current settings. Cheap: one read lock and an `Arc` clone.
    #[inline]
    pub fn snapshot(&self) -> Arc<FetchSettings> {
        self.settings.read().clone()
    }

    /// Whether silent mode is active right now.
    pub fn is_cooling_down(&self) -> bool {
        self.snapshot().is_cooling_down(self.clock.now_ms())
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.snapshot().kill_switch
    }

    /// Apply a config delta as a single swap. Returns the new settings.
    pub fn apply(&self, delta: &ConfigDelta) -> Arc<FetchSettings> {
        if delta.is_empty() {
            return self.snapshot();
        }

        let now_ms = self.clock.now_ms();
        let mut guard = self.settings.write();
        let mut next = FetchSettings::clone(&guard);

        if let Some(kill_switch) = delta.kill_switch {
            if kill_switch != next.kill_switch {
                info!(kill_switch, "Kill switch changed");
            }
            next.kill_switch = kill_switch;
        }
        if let Some(cooldown_secs) = delta.cooldown_seconds {
            let cooldown_ms = i64::try_from(cooldown_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            next.cooldown_until_ms = now_ms.saturating_add(cooldown_ms);
            if cooldown_secs > 0 {
                info!(cooldown_secs, "Silent mode engaged");
            }
        }
        if let Some(enabled) = delta.csm_enabled {
            next.csm_enabled = enabled;
        }
        if let Some(batch_size) = delta.csm_batch_size {
            next.csm_batch_size = batch_size.max(1);
        }

        let next = Arc::new(next);
        *guard = next.clone();
        next
    }
}

impl std::fmt::Debug for GlobalFetchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalFetchState")
            .field("settings", &self.snapshot())
            .finish()
    }
}

/// Engine counters for observability.
#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Total `request_bid` calls.
    pub bid_requests: AtomicU64,
    /// Bids handed to a caller.
    pub bids_served: AtomicU64,
    /// Requests answered "no bid" because of silent mode.
    pub suppressed_cooldown: AtomicU64,
    /// Requests answered "no bid" because a zero-CPM bid is cached.
    pub suppressed_no_bid: AtomicU64,
    /// Refreshes skipped because the kill switch is engaged.
    pub suppressed_kill_switch: AtomicU64,
    /// Refreshes skipped because a fetch was already in flight.
    pub fetches_deduplicated: AtomicU64,
    /// Batches submitted to the fetch executor.
    pub fetches_started: AtomicU64,
    /// Batches that ended in a network error or panic.
    pub fetches_failed: AtomicU64,
    /// Bids written to the cache.
    pub bids_stored: AtomicU64,
    /// Response slots dropped as malformed.
    pub malformed_slots: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineCountersSnapshot {
        EngineCountersSnapshot {
            bid_requests: self.bid_requests.load(Ordering::Relaxed),
            bids_served: self.bids_served.load(Ordering::Relaxed),
            suppressed_cooldown: self.suppressed_cooldown.load(Ordering::Relaxed),
            suppressed_no_bid: self.suppressed_no_bid.load(Ordering::Relaxed),
            suppressed_kill_switch: self.suppressed_kill_switch.load(Ordering::Relaxed),
            fetches_deduplicated: self.fetches_deduplicated.load(Ordering::Relaxed),
            fetches_started: self.fetches_started.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            bids_stored: self.bids_stored.load(Ordering::Relaxed),
            malformed_slots: self.malformed_slots.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCountersSnapshot {
    pub bid_requests: u64,
    pub bids_served: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_no_bid: u64,
    pub suppressed_kill_switch: u64,
    pub fetches_deduplicated: u64,
    pub fetches_started: u64,
    pub fetches_failed: u64,
    pub bids_stored: u64,
    pub malformed_slots: u64,
}

impl EngineCountersSnapshot {
    /// Share of requests that were served a bid, in percent.
    pub fn fill_rate(&self) -> f64 {
        if self.bid_requests == 0 {
            0.0
        } else {
            (self.bids_served as f64 / self.bid_requests as f64) * 100.0
        }
    }
}
