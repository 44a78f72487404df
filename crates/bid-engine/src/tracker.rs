//! In-flight tracker - at most one pending fetch per placement.
//!
//! Claiming a key is a single `DashSet::insert`, so two callers racing on the
//! same placement can never both observe "not in flight". The winner owns an
//! [`InFlightClaim`]; dropping the claim releases the key, which makes the
//! release happen exactly once whether the fetch succeeds, fails or panics.

use std::sync::Arc;

use bid_common::PlacementKey;
use dashmap::DashSet;
use tracing::debug;

use crate::preconditions::throw_or_log;

/// Tracks placements with a fetch in flight.
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    in_flight: Arc<DashSet<PlacementKey>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the key in flight.
    ///
    /// Returns true if the caller now owns the fetch for this key.
    /// Returns false if a fetch is already pending.
    pub fn try_claim(&self, key: &PlacementKey) -> bool {
        let claimed = self.in_flight.insert(key.clone());
        debug!(placement = %key, claimed, "In-flight claim");
        claimed
    }

    /// Claim the key and get a guard that releases it on drop.
    pub fn try_claim_guarded(&self, key: &PlacementKey) -> Option<InFlightClaim> {
        self.try_claim(key).then(|| InFlightClaim {
            tracker: self.clone(),
            key: key.clone(),
            released: false,
        })
    }

    /// Release a claim.
    ///
    /// Releasing a key that is not in flight is a defect.
    pub fn release(&self, key: &PlacementKey) {
        if self.in_flight.remove(key).is_none() {
            throw_or_log(format!("release of placement not in flight: {}", key));
        }
    }

    pub fn is_in_flight(&self, key: &PlacementKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Number of placements in flight (for debugging/metrics).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// Ownership of an in-flight key. Releases the key when dropped.
#[derive(Debug)]
pub struct InFlightClaim {
    tracker: InFlightTracker,
    key: PlacementKey,
    released: bool,
}

impl InFlightClaim {
    pub fn key(&self) -> &PlacementKey {
        &self.key
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        let removed = self.tracker.in_flight.remove(&self.key).is_some();
        debug!(placement = %self.key, "In-flight release");
        if !removed && !std::thread::panicking() {
            throw_or_log(format!("claim released twice: {}", self.key));
        }
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.release_inner();
    }
}
