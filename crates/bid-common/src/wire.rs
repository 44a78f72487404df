//! Wire types exchanged with the bidding backend.
//!
//! The exact JSON layout is owned by the backend. These types cover the
//! contract the engine depends on: a batch of placements goes out with the
//! device/privacy/publisher context, per-placement bids and an optional
//! config object come back.
//!
//! Slots in a response are kept as raw JSON values and decoded one at a
//! time with [`decode_slot`], so a malformed slot never fails the batch.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AdFormat, AdSize, PlacementKey};

/// Publisher identity sent with every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Publisher {
    pub publisher_id: String,
    pub bundle_id: String,
}

/// Privacy signals attached to the user section of a bid request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacySignals {
    /// IAB US privacy string.
    #[serde(rename = "uspIab", default, skip_serializing_if = "Option::is_none")]
    pub us_privacy: Option<String>,
    /// Publisher-managed US privacy opt-out flag.
    #[serde(rename = "uspOptout", default, skip_serializing_if = "Option::is_none")]
    pub us_privacy_optout: Option<String>,
    /// GDPR consent, sent at request level.
    #[serde(skip)]
    pub gdpr: Option<GdprConsent>,
}

/// GDPR consent data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GdprConsent {
    pub consent_data: String,
    pub gdpr_applies: Option<bool>,
    pub version: u8,
}

/// Device and user section of a bid request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(flatten)]
    pub privacy: PrivacySignals,
}

/// One requested placement inside a bid request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdbRequestSlot {
    pub imp_id: String,
    pub placement_id: String,
    pub sizes: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_native: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interstitial: bool,
}

impl CdbRequestSlot {
    pub fn for_key(key: &PlacementKey, imp_id: String) -> Self {
        Self {
            imp_id,
            placement_id: key.placement_id().to_string(),
            sizes: vec![key.size().to_string()],
            is_native: key.format() == AdFormat::Native,
            interstitial: key.format() == AdFormat::Interstitial,
        }
    }
}

/// Bid request: one network round trip for a batch of placements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdbRequest {
    pub id: String,
    pub publisher: Publisher,
    pub user: UserContext,
    pub sdk_version: String,
    pub profile_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gdpr_consent: Option<GdprConsent>,
    pub slots: Vec<CdbRequestSlot>,
}

/// Remote config request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfigRequest {
    pub publisher_id: String,
    pub bundle_id: String,
    pub sdk_version: String,
    pub profile_id: i32,
}

/// Config object returned by the backend. Absent fields leave the current
/// value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_switch: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csm_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csm_batch_size: Option<u32>,
}

impl RemoteConfig {
    pub fn is_empty(&self) -> bool {
        self.kill_switch.is_none()
            && self.cooldown_seconds.is_none()
            && self.csm_enabled.is_none()
            && self.csm_batch_size.is_none()
    }
}

/// Bid response. Slots stay raw until decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdbResponse {
    #[serde(default)]
    pub slots: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_next_call: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RemoteConfig>,
}

impl CdbResponse {
    /// Decode every slot, splitting valid slots from rejected ones.
    pub fn decode_slots(&self) -> (Vec<CdbSlot>, Vec<SlotError>) {
        let mut slots = Vec::with_capacity(self.slots.len());
        let mut errors = Vec::new();
        for raw in &self.slots {
            match decode_slot(raw.clone()) {
                Ok(slot) => slots.push(slot),
                Err(e) => errors.push(e),
            }
        }
        (slots, errors)
    }
}

/// Creative the caller renders when a bid wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreativePayload {
    /// URL of a display creative.
    DisplayUrl(String),
    /// Native assets, passed through untouched.
    Native(serde_json::Value),
    /// No creative; only valid on a zero-CPM (no bid) slot.
    Empty,
}

/// Errors that reject a single slot of a response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("Malformed slot: {0}")]
    Malformed(String),

    #[error("Invalid CPM for {placement_id}: {value}")]
    InvalidCpm { placement_id: String, value: String },

    #[error("Negative TTL for {placement_id}: {ttl}")]
    NegativeTtl { placement_id: String, ttl: i64 },

    #[error("TTL out of range for {placement_id}: {ttl}")]
    TtlOutOfRange { placement_id: String, ttl: i64 },

    #[error("Missing creative for {0}")]
    MissingCreative(String),
}

/// Validated slot of a bid response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdbSlot {
    pub imp_id: Option<String>,
    pub placement_id: String,
    pub size: AdSize,
    pub is_native: bool,
    pub cpm: Decimal,
    pub ttl_secs: u64,
    pub payload: CreativePayload,
}

impl CdbSlot {
    /// Whether this slot answers the given placement.
    pub fn matches(&self, key: &PlacementKey) -> bool {
        key.matches(&self.placement_id, self.size, self.is_native)
    }

    /// Render the slot in the backend's wire layout.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut raw = serde_json::json!({
            "placementId": self.placement_id,
            "width": self.size.width,
            "height": self.size.height,
            "cpm": self.cpm.to_string(),
            "ttl": self.ttl_secs,
        });
        if let Some(imp_id) = &self.imp_id {
            raw["impId"] = serde_json::Value::String(imp_id.clone());
        }
        match &self.payload {
            CreativePayload::DisplayUrl(url) => {
                raw["displayUrl"] = serde_json::Value::String(url.clone());
            }
            CreativePayload::Native(assets) => {
                raw["isNative"] = serde_json::Value::Bool(true);
                raw["native"] = assets.clone();
            }
            CreativePayload::Empty => {
                if self.is_native {
                    raw["isNative"] = serde_json::Value::Bool(true);
                }
            }
        }
        raw
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSlot {
    #[serde(default)]
    imp_id: Option<String>,
    placement_id: String,
    width: u32,
    height: u32,
    cpm: serde_json::Value,
    #[serde(default)]
    display_url: Option<String>,
    #[serde(default)]
    native: Option<serde_json::Value>,
    #[serde(default)]
    ttl: i64,
    #[serde(default)]
    is_native: bool,
}

/// Longest TTL a slot may carry (one year).
pub const MAX_TTL_SECS: i64 = 365 * 24 * 60 * 60;

/// Decode and validate one raw slot.
pub fn decode_slot(value: serde_json::Value) -> Result<CdbSlot, SlotError> {
    let raw: RawSlot =
        serde_json::from_value(value).map_err(|e| SlotError::Malformed(e.to_string()))?;

    let cpm = parse_cpm(&raw.cpm).ok_or_else(|| SlotError::InvalidCpm {
        placement_id: raw.placement_id.clone(),
        value: raw.cpm.to_string(),
    })?;

    if raw.ttl < 0 {
        return Err(SlotError::NegativeTtl {
            placement_id: raw.placement_id,
            ttl: raw.ttl,
        });
    }
    if raw.ttl > MAX_TTL_SECS {
        return Err(SlotError::TtlOutOfRange {
            placement_id: raw.placement_id,
            ttl: raw.ttl,
        });
    }

    let is_native = raw.is_native || raw.native.is_some();
    let payload = match (raw.native, raw.display_url) {
        (Some(assets), _) => CreativePayload::Native(assets),
        (None, Some(url)) if !url.is_empty() => CreativePayload::DisplayUrl(url),
        _ => CreativePayload::Empty,
    };
    if cpm > Decimal::ZERO && payload == CreativePayload::Empty {
        return Err(SlotError::MissingCreative(raw.placement_id));
    }

    Ok(CdbSlot {
        imp_id: raw.imp_id,
        placement_id: raw.placement_id,
        size: AdSize::new(raw.width, raw.height),
        is_native,
        cpm,
        ttl_secs: raw.ttl as u64,
        payload,
    })
}

/// CPM arrives as a decimal string, occasionally as a bare number.
fn parse_cpm(value: &serde_json::Value) -> Option<Decimal> {
    let cpm = match value {
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok()?,
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok()?,
        _ => return None,
    };
    (cpm >= Decimal::ZERO).then_some(cpm)
}
