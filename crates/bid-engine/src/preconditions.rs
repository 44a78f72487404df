//! Invariant reporting.
//!
//! A broken invariant (double release of an in-flight claim, for instance) is
//! a defect, not a recoverable condition. Debug builds panic so the defect
//! surfaces in tests; release builds log at error level and carry on.

use std::fmt;

use tracing::error;

/// Report an invariant violation.
#[track_caller]
pub fn throw_or_log(message: impl fmt::Display) {
    if cfg!(debug_assertions) {
        panic!("Invariant violated: {}", message);
    }
    let location = std::panic::Location::caller();
    error!(location = %location, "Invariant violated: {}", message);
}
