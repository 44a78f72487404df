//! HTTP client for the bidding backend.

use async_trait::async_trait;
use bid_common::{CdbRequest, CdbResponse, RemoteConfig, RemoteConfigRequest};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::{ApiError, BidApi};
use crate::config::NetworkConfig;
use crate::csm::MetricRequest;

pub struct HttpBidApi {
    http: Client,
    cdb_url: String,
    config_url: String,
    csm_url: String,
}

impl HttpBidApi {
    pub fn new(network: &NetworkConfig) -> Result<Self, ApiError> {
        let http = Client::builder().timeout(network.timeout).build()?;
        Ok(Self {
            http,
            cdb_url: network.cdb_url.clone(),
            config_url: network.config_url.clone(),
            csm_url: network.csm_url.clone(),
        })
    }

    async fn check_status(response: Response, endpoint: &str) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        warn!(
            endpoint,
            status = status.as_u16(),
            body = %body,
            "Backend API error"
        );
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn decode<T: DeserializeOwned>(response: Response, endpoint: &str) -> Result<T, ApiError> {
        // 204 means "nothing for you"; decode it as an empty object.
        let bytes = response.bytes().await?;
        let bytes: &[u8] = if bytes.is_empty() { b"{}" } else { &bytes };
        serde_json::from_slice(bytes)
            .map_err(|e| ApiError::Decode(format!("Failed to parse {} response: {}", endpoint, e)))
    }
}

#[async_trait]
impl BidApi for HttpBidApi {
    async fn fetch_bids(&self, request: &CdbRequest) -> Result<CdbResponse, ApiError> {
        debug!(url = %self.cdb_url, slots = request.slots.len(), "Posting bid request");
        let response = self.http.post(&self.cdb_url).json(request).send().await?;
        let response = Self::check_status(response, "cdb").await?;
        Self::decode(response, "cdb").await
    }

    async fn fetch_config(&self, request: &RemoteConfigRequest) -> Result<RemoteConfig, ApiError> {
        debug!(url = %self.config_url, "Posting config request");
        let response = self.http.post(&self.config_url).json(request).send().await?;
        let response = Self::check_status(response, "config").await?;
        Self::decode(response, "config").await
    }

    async fn post_metrics(&self, request: &MetricRequest) -> Result<(), ApiError> {
        debug!(url = %self.csm_url, count = request.feedbacks.len(), "Posting metrics");
        let response = self.http.post(&self.csm_url).json(request).send().await?;
        Self::check_status(response, "csm").await?;
        Ok(())
    }
}
