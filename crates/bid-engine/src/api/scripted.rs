//! In-memory backend.
//!
//! Replies are queued per endpoint and consumed in order. When a queue is
//! empty the backend falls back to its default: an empty response, or an
//! automatic bid for every requested slot when auto-bidding is on. Calls can
//! be held behind a gate so tests can observe a fetch while it is in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bid_common::{
    AdSize, CdbRequest, CdbResponse, CdbSlot, CreativePayload, RemoteConfig, RemoteConfigRequest,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;

use super::{ApiError, BidApi};
use crate::csm::{Metric, MetricRequest};

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply<T> {
    Ok(T),
    /// Fail with `ApiError::Status`.
    Status(u16),
    /// Fail with `ApiError::Unavailable`.
    Unavailable,
    /// Panic inside the call.
    Panic,
}

impl<T> Reply<T> {
    fn into_result(self, endpoint: &str) -> Result<T, ApiError> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Status(status) => Err(ApiError::Status {
                status,
                body: format!("scripted {} failure", endpoint),
            }),
            Reply::Unavailable => Err(ApiError::Unavailable(format!("scripted {}", endpoint))),
            Reply::Panic => panic!("scripted {} panic", endpoint),
        }
    }
}

/// Automatic bid returned for every requested slot.
#[derive(Debug, Clone)]
pub struct AutoBid {
    pub cpm: Decimal,
    pub ttl_secs: u64,
}

#[derive(Debug, Default)]
struct Script {
    bids: VecDeque<Reply<CdbResponse>>,
    configs: VecDeque<Reply<RemoteConfig>>,
    metrics: VecDeque<Reply<()>>,
    auto_bid: Option<AutoBid>,
    bid_requests: Vec<CdbRequest>,
    sent_metrics: Vec<Metric>,
}

pub struct ScriptedBidApi {
    script: Mutex<Script>,
    gate_tx: watch::Sender<bool>,
    gate_rx: watch::Receiver<bool>,
    delay: Mutex<Option<Duration>>,
    bid_calls: AtomicU64,
    config_calls: AtomicU64,
    metric_calls: AtomicU64,
}

impl ScriptedBidApi {
    pub fn new() -> Self {
        let (gate_tx, gate_rx) = watch::channel(true);
        Self {
            script: Mutex::new(Script::default()),
            gate_tx,
            gate_rx,
            delay: Mutex::new(None),
            bid_calls: AtomicU64::new(0),
            config_calls: AtomicU64::new(0),
            metric_calls: AtomicU64::new(0),
        }
    }

    /// Backend answering every slot with the given bid.
    pub fn auto_bidding(cpm: Decimal, ttl_secs: u64) -> Self {
        let api = Self::new();
        api.script.lock().auto_bid = Some(AutoBid { cpm, ttl_secs });
        api
    }

    pub fn push_bids(&self, reply: Reply<CdbResponse>) {
        self.script.lock().bids.push_back(reply);
    }

    pub fn push_config(&self, reply: Reply<RemoteConfig>) {
        self.script.lock().configs.push_back(reply);
    }

    pub fn push_metrics(&self, reply: Reply<()>) {
        self.script.lock().metrics.push_back(reply);
    }

    /// Hold bid and config calls until `open_gate`.
    pub fn close_gate(&self) {
        self.gate_tx.send_replace(false);
    }

    pub fn open_gate(&self) {
        self.gate_tx.send_replace(true);
    }

    /// Add latency to every call.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn bid_calls(&self) -> u64 {
        self.bid_calls.load(Ordering::SeqCst)
    }

    pub fn config_calls(&self) -> u64 {
        self.config_calls.load(Ordering::SeqCst)
    }

    pub fn metric_calls(&self) -> u64 {
        self.metric_calls.load(Ordering::SeqCst)
    }

    /// Bid requests received so far.
    pub fn bid_requests(&self) -> Vec<CdbRequest> {
        self.script.lock().bid_requests.clone()
    }

    /// Metrics accepted so far.
    pub fn sent_metrics(&self) -> Vec<Metric> {
        self.script.lock().sent_metrics.clone()
    }

    async fn pass_gate(&self) {
        let mut gate = self.gate_rx.clone();
        // The sender lives as long as `self`, so this only fails on teardown.
        let _ = gate.wait_for(|open| *open).await;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn auto_response(auto: &AutoBid, request: &CdbRequest) -> CdbResponse {
        let slots = request
            .slots
            .iter()
            .map(|slot| {
                let size = slot
                    .sizes
                    .first()
                    .and_then(|s| s.parse::<AdSize>().ok())
                    .unwrap_or(AdSize::new(0, 0));
                let payload = if auto.cpm.is_zero() {
                    CreativePayload::Empty
                } else if slot.is_native {
                    CreativePayload::Native(serde_json::json!({ "products": [] }))
                } else {
                    CreativePayload::DisplayUrl(format!(
                        "https://cdn.example.com/{}.js",
                        slot.placement_id
                    ))
                };
                CdbSlot {
                    imp_id: Some(slot.imp_id.clone()),
                    placement_id: slot.placement_id.clone(),
                    size,
                    is_native: slot.is_native,
                    cpm: auto.cpm,
                    ttl_secs: auto.ttl_secs,
                    payload,
                }
                .to_wire()
            })
            .collect();
        CdbResponse {
            slots,
            ..Default::default()
        }
    }
}

impl Default for ScriptedBidApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BidApi for ScriptedBidApi {
    async fn fetch_bids(&self, request: &CdbRequest) -> Result<CdbResponse, ApiError> {
        self.bid_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;

        let reply = {
            let mut script = self.script.lock();
            script.bid_requests.push(request.clone());
            match script.bids.pop_front() {
                Some(reply) => reply,
                None => Reply::Ok(match &script.auto_bid {
                    Some(auto) => Self::auto_response(auto, request),
                    None => CdbResponse::default(),
                }),
            }
        };
        reply.into_result("cdb")
    }

    async fn fetch_config(&self, _request: &RemoteConfigRequest) -> Result<RemoteConfig, ApiError> {
        self.config_calls.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;

        let reply = self
            .script
            .lock()
            .configs
            .pop_front()
            .unwrap_or(Reply::Ok(RemoteConfig::default()));
        reply.into_result("config")
    }

    async fn post_metrics(&self, request: &MetricRequest) -> Result<(), ApiError> {
        self.metric_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        let reply = script.metrics.pop_front().unwrap_or(Reply::Ok(()));
        if matches!(reply, Reply::Ok(())) {
            script.sent_metrics.extend(request.feedbacks.iter().cloned());
        }
        drop(script);
        reply.into_result("csm")
    }
}
