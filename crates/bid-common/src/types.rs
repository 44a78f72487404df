//! Placement identity types.
//!
//! A `PlacementKey` is the only valid key into the bid cache and the
//! in-flight tracker. Equality and hashing are by value.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Creative size in density-independent pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdSize {
    pub width: u32,
    pub height: u32,
}

impl AdSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either dimension is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for AdSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for AdSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid ad size: {}", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid ad width: {}", s))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid ad height: {}", s))?;
        Ok(AdSize { width, height })
    }
}

/// Ad format requested for a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdFormat {
    #[default]
    Banner,
    Interstitial,
    Native,
}

impl AdFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdFormat::Banner => "banner",
            AdFormat::Interstitial => "interstitial",
            AdFormat::Native => "native",
        }
    }
}

impl fmt::Display for AdFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AdFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "banner" => Ok(AdFormat::Banner),
            "interstitial" => Ok(AdFormat::Interstitial),
            "native" => Ok(AdFormat::Native),
            _ => Err(format!("Unknown ad format: {}", s)),
        }
    }
}

/// Immutable identifier of an ad placement: id, size and format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlacementKey {
    placement_id: String,
    size: AdSize,
    format: AdFormat,
}

impl PlacementKey {
    pub fn new(placement_id: impl Into<String>, size: AdSize, format: AdFormat) -> Self {
        Self {
            placement_id: placement_id.into(),
            size,
            format,
        }
    }

    pub fn banner(placement_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new(placement_id, AdSize::new(width, height), AdFormat::Banner)
    }

    pub fn interstitial(placement_id: impl Into<String>, width: u32, height: u32) -> Self {
        Self::new(placement_id, AdSize::new(width, height), AdFormat::Interstitial)
    }

    pub fn native(placement_id: impl Into<String>) -> Self {
        // Native placements are sized by the publisher's layout; the backend
        // expects the conventional 2x2 marker size.
        Self::new(placement_id, AdSize::new(2, 2), AdFormat::Native)
    }

    pub fn placement_id(&self) -> &str {
        &self.placement_id
    }

    pub fn size(&self) -> AdSize {
        self.size
    }

    pub fn format(&self) -> AdFormat {
        self.format
    }

    /// Whether a backend slot with the given identity answers this key.
    pub fn matches(&self, placement_id: &str, size: AdSize, is_native: bool) -> bool {
        self.placement_id == placement_id
            && self.size == size
            && (self.format == AdFormat::Native) == is_native
    }
}

impl fmt::Display for PlacementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.placement_id, self.size, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ad_size_display_and_parse() {
        let size = AdSize::new(320, 50);
        assert_eq!(size.to_string(), "320x50");
        assert_eq!("320x50".parse::<AdSize>().unwrap(), size);
        assert_eq!("300X250".parse::<AdSize>().unwrap(), AdSize::new(300, 250));
        assert!("320".parse::<AdSize>().is_err());
        assert!("ax50".parse::<AdSize>().is_err());
    }

    #[test]
    fn test_ad_size_is_empty() {
        assert!(AdSize::new(0, 50).is_empty());
        assert!(!AdSize::new(1, 1).is_empty());
    }

    #[test]
    fn test_ad_format_from_str() {
        assert_eq!("banner".parse::<AdFormat>(), Ok(AdFormat::Banner));
        assert_eq!("NATIVE".parse::<AdFormat>(), Ok(AdFormat::Native));
        assert_eq!(
            "Interstitial".parse::<AdFormat>(),
            Ok(AdFormat::Interstitial)
        );
        assert!("video".parse::<AdFormat>().is_err());
    }

    #[test]
    fn test_placement_key_value_equality() {
        let a = PlacementKey::banner("/140800857/Endeavour_320x50", 320, 50);
        let b = PlacementKey::banner("/140800857/Endeavour_320x50", 320, 50);
        let c = PlacementKey::interstitial("/140800857/Endeavour_320x50", 320, 50);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_placement_key_matches() {
        let banner = PlacementKey::banner("p1", 320, 50);
        assert!(banner.matches("p1", AdSize::new(320, 50), false));
        assert!(!banner.matches("p1", AdSize::new(320, 50), true));
        assert!(!banner.matches("p1", AdSize::new(300, 250), false));
        assert!(!banner.matches("p2", AdSize::new(320, 50), false));

        let native = PlacementKey::native("n1");
        assert!(native.matches("n1", AdSize::new(2, 2), true));
    }

    #[test]
    fn test_placement_key_display() {
        let key = PlacementKey::banner("p1", 320, 50);
        assert_eq!(key.to_string(), "p1@320x50/banner");
    }
}
