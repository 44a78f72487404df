//! Shared types for the bid cache engine.
//!
//! This crate contains:
//! - Placement identity (AdSize, AdFormat, PlacementKey)
//! - Wire types exchanged with the bidding backend (bid request/response,
//!   remote config)
//! - Slot decoding with per-slot validation

pub mod types;
pub mod wire;

pub use types::*;
pub use wire::*;
