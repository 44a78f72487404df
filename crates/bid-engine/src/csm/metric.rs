//! Client-side metric records.

use serde::{Deserialize, Serialize};

/// One client-side metric. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub impression_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_id: Option<String>,
    /// Bid call start (ms since epoch).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdb_call_start_ms: Option<i64>,
    /// Bid call end (ms since epoch). Absent when the call failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdb_call_end_ms: Option<i64>,
    #[serde(default)]
    pub cdb_call_timeout: bool,
    #[serde(default)]
    pub network_exception: bool,
    /// Time between bid download and consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(default)]
    pub ready_to_send: bool,
}

impl Metric {
    pub fn builder(impression_id: impl Into<String>) -> MetricBuilder {
        MetricBuilder::new(impression_id)
    }
}

#[derive(Debug, Clone)]
pub struct MetricBuilder {
    metric: Metric,
}

impl MetricBuilder {
    pub fn new(impression_id: impl Into<String>) -> Self {
        Self {
            metric: Metric {
                impression_id: impression_id.into(),
                placement_id: None,
                cdb_call_start_ms: None,
                cdb_call_end_ms: None,
                cdb_call_timeout: false,
                network_exception: false,
                elapsed_ms: None,
                ready_to_send: true,
            },
        }
    }

    pub fn placement_id(mut self, placement_id: impl Into<String>) -> Self {
        self.metric.placement_id = Some(placement_id.into());
        self
    }

    pub fn cdb_call_start(mut self, at_ms: i64) -> Self {
        self.metric.cdb_call_start_ms = Some(at_ms);
        self
    }

    pub fn cdb_call_end(mut self, at_ms: i64) -> Self {
        self.metric.cdb_call_end_ms = Some(at_ms);
        self
    }

    pub fn timeout(mut self) -> Self {
        self.metric.cdb_call_timeout = true;
        self
    }

    pub fn network_exception(mut self) -> Self {
        self.metric.network_exception = true;
        self
    }

    pub fn elapsed(mut self, elapsed_ms: i64) -> Self {
        self.metric.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn ready_to_send(mut self, ready: bool) -> Self {
        self.metric.ready_to_send = ready;
        self
    }

    pub fn build(self) -> Metric {
        self.metric
    }
}

/// Payload of one metrics send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRequest {
    pub feedbacks: Vec<Metric>,
    pub sdk_version: String,
    pub profile_id: i32,
}

impl MetricRequest {
    pub fn new(feedbacks: Vec<Metric>, sdk_version: impl Into<String>, profile_id: i32) -> Self {
        Self {
            feedbacks,
            sdk_version: sdk_version.into(),
            profile_id,
        }
    }
}
