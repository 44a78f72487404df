//! Network seam to the bidding backend.
//!
//! - `http`: reqwest client for the real backend
//! - `scripted`: in-memory backend with call counters and failure injection

pub mod http;
pub mod scripted;

use async_trait::async_trait;
use bid_common::{CdbRequest, CdbResponse, RemoteConfig, RemoteConfigRequest};
use thiserror::Error;

use crate::csm::MetricRequest;

pub use http::HttpBidApi;
pub use scripted::ScriptedBidApi;

/// Errors crossing the backend seam.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend returned an error status.
    #[error("API error: status {status}, body: {body}")]
    Status { status: u16, body: String },

    /// Body could not be decoded.
    #[error("Decode failed: {0}")]
    Decode(String),

    /// Backend unreachable for a reason other than HTTP.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl ApiError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Bidding backend operations.
#[async_trait]
pub trait BidApi: Send + Sync {
    /// One bid round trip for a batch of placements.
    async fn fetch_bids(&self, request: &CdbRequest) -> Result<CdbResponse, ApiError>;

    /// Fetch the remote config.
    async fn fetch_config(&self, request: &RemoteConfigRequest) -> Result<RemoteConfig, ApiError>;

    /// Post a batch of client-side metrics.
    async fn post_metrics(&self, request: &MetricRequest) -> Result<(), ApiError>;
}
