//! Configuration for the bid engine.
//!
//! Loaded from a TOML file, then environment variable overrides, then CLI
//! overrides, then validated.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bid_common::{AdFormat, PlacementKey};
use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logging level.
    pub log_level: String,

    /// Publisher identity sent with every request.
    pub publisher: PublisherConfig,

    /// Backend endpoints.
    pub network: NetworkConfig,

    /// Local client-side metrics defaults. The remote config overrides
    /// `enabled` and `batch_size` at runtime.
    pub csm: CsmConfig,

    /// Placements registered in advance for batching and startup prefetch.
    pub placements: Vec<PlacementKey>,
}

/// Publisher identity.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub publisher_id: String,
    pub bundle_id: String,
    /// Integration profile. Requests are never sent with a profile <= 0.
    pub profile_id: i32,
    pub sdk_version: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            publisher_id: String::new(),
            bundle_id: String::new(),
            profile_id: 235,
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Backend endpoints.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Bid endpoint.
    pub cdb_url: String,
    /// Remote config endpoint.
    pub config_url: String,
    /// Client-side metrics endpoint.
    pub csm_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            cdb_url: "https://bidder.example.com/inapp/v2".to_string(),
            config_url: "https://pub-sdk-cfg.example.com/v2.0/api/config".to_string(),
            csm_url: "https://bidder.example.com/csm".to_string(),
            timeout: Duration::from_millis(10_000),
        }
    }
}

/// Client-side metrics defaults.
#[derive(Debug, Clone)]
pub struct CsmConfig {
    pub enabled: bool,
    /// Maximum metrics per send.
    pub batch_size: u32,
    /// Queue capacity. The oldest metric is evicted when full.
    pub max_queue_size: usize,
    /// Period of the background flush.
    pub flush_interval: Duration,
}

impl Default for CsmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            max_queue_size: 256,
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            publisher: PublisherConfig::default(),
            network: NetworkConfig::default(),
            csm: CsmConfig::default(),
            placements: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: TomlConfig = toml::from_str(content).context("Failed to parse TOML config")?;
        Ok(Self::from(file))
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(id) = std::env::var("BID_PUBLISHER_ID") {
            self.publisher.publisher_id = id;
        }
        if let Ok(url) = std::env::var("BID_CDB_URL") {
            self.network.cdb_url = url;
        }
        if let Ok(url) = std::env::var("BID_CONFIG_URL") {
            self.network.config_url = url;
        }
        if let Ok(url) = std::env::var("BID_CSM_URL") {
            self.network.csm_url = url;
        }
        if let Ok(level) = std::env::var("BID_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_cli_overrides(
        &mut self,
        log_level: Option<String>,
        publisher_id: Option<String>,
        cdb_url: Option<String>,
    ) {
        if let Some(level) = log_level {
            self.log_level = level;
        }

        if let Some(id) = publisher_id
            && !id.is_empty()
        {
            self.publisher.publisher_id = id;
        }

        if let Some(url) = cdb_url {
            self.network.cdb_url = url;
        }
    }

    /// Validate configuration and return errors for invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.publisher.publisher_id.trim().is_empty() {
            bail!("publisher_id is required (set [publisher] publisher_id or BID_PUBLISHER_ID)");
        }
        if self.publisher.profile_id <= 0 {
            bail!("profile_id must be positive");
        }

        if self.network.timeout.is_zero() {
            bail!("timeout_ms must be positive");
        }

        if self.csm.batch_size == 0 {
            bail!("csm batch_size must be at least 1");
        }
        if self.csm.max_queue_size < self.csm.batch_size as usize {
            bail!("csm max_queue_size cannot be smaller than batch_size");
        }

        for placement in &self.placements {
            if placement.placement_id().trim().is_empty() {
                bail!("Placement id cannot be empty");
            }
            if placement.size().is_empty() {
                bail!("Placement {} has an empty size", placement.placement_id());
            }
        }

        Ok(())
    }
}

// ============================================================================
// TOML deserialization structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct TomlConfig {
    #[serde(default)]
    general: GeneralToml,
    #[serde(default)]
    publisher: PublisherToml,
    #[serde(default)]
    network: NetworkToml,
    #[serde(default)]
    csm: CsmToml,
    #[serde(default)]
    placements: Vec<PlacementToml>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GeneralToml {
    log_level: String,
}

impl Default for GeneralToml {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PublisherToml {
    publisher_id: String,
    bundle_id: String,
    profile_id: i32,
    sdk_version: String,
}

impl Default for PublisherToml {
    fn default() -> Self {
        let defaults = PublisherConfig::default();
        Self {
            publisher_id: defaults.publisher_id,
            bundle_id: defaults.bundle_id,
            profile_id: defaults.profile_id,
            sdk_version: defaults.sdk_version,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct NetworkToml {
    cdb_url: String,
    config_url: String,
    csm_url: String,
    timeout_ms: u64,
}

impl Default for NetworkToml {
    fn default() -> Self {
        let defaults = NetworkConfig::default();
        Self {
            cdb_url: defaults.cdb_url,
            config_url: defaults.config_url,
            csm_url: defaults.csm_url,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CsmToml {
    enabled: bool,
    batch_size: u32,
    max_queue_size: usize,
    flush_interval_secs: u64,
}

impl Default for CsmToml {
    fn default() -> Self {
        let defaults = CsmConfig::default();
        Self {
            enabled: defaults.enabled,
            batch_size: defaults.batch_size,
            max_queue_size: defaults.max_queue_size,
            flush_interval_secs: defaults.flush_interval.as_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlacementToml {
    id: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    format: AdFormat,
}

impl From<PlacementToml> for PlacementKey {
    fn from(toml: PlacementToml) -> Self {
        match toml.format {
            AdFormat::Native => PlacementKey::native(toml.id),
            AdFormat::Interstitial => PlacementKey::interstitial(toml.id, toml.width, toml.height),
            AdFormat::Banner => PlacementKey::banner(toml.id, toml.width, toml.height),
        }
    }
}

impl From<TomlConfig> for EngineConfig {
    fn from(toml: TomlConfig) -> Self {
        Self {
            log_level: toml.general.log_level,
            publisher: PublisherConfig {
                publisher_id: toml.publisher.publisher_id,
                bundle_id: toml.publisher.bundle_id,
                profile_id: toml.publisher.profile_id,
                sdk_version: toml.publisher.sdk_version,
            },
            network: NetworkConfig {
                cdb_url: toml.network.cdb_url,
                config_url: toml.network.config_url,
                csm_url: toml.network.csm_url,
                timeout: Duration::from_millis(toml.network.timeout_ms),
            },
            csm: CsmConfig {
                enabled: toml.csm.enabled,
                batch_size: toml.csm.batch_size,
                max_queue_size: toml.csm.max_queue_size,
                flush_interval: Duration::from_secs(toml.csm.flush_interval_secs),
            },
            placements: toml.placements.into_iter().map(PlacementKey::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bid_common::AdSize;

    fn valid_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.publisher.publisher_id = "B-000001".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.publisher.profile_id, 235);
        assert!(config.csm.enabled);
        assert_eq!(config.csm.batch_size, 10);
        assert!(config.placements.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [general]
            log_level = "debug"

            [publisher]
            publisher_id = "B-123456"
            bundle_id = "com.example.app"
            profile_id = 295

            [network]
            cdb_url = "http://localhost:9000/cdb"
            timeout_ms = 2500

            [csm]
            enabled = false
            batch_size = 5
            max_queue_size = 50

            [[placements]]
            id = "home-banner"
            width = 320
            height = 50

            [[placements]]
            id = "level-end"
            width = 320
            height = 480
            format = "interstitial"

            [[placements]]
            id = "feed"
            format = "native"
        "#;

        let config = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.publisher.publisher_id, "B-123456");
        assert_eq!(config.publisher.bundle_id, "com.example.app");
        assert_eq!(config.publisher.profile_id, 295);
        assert_eq!(config.network.cdb_url, "http://localhost:9000/cdb");
        assert_eq!(config.network.timeout, Duration::from_millis(2500));
        // Untouched keys keep their defaults
        assert_eq!(config.network.csm_url, NetworkConfig::default().csm_url);
        assert!(!config.csm.enabled);
        assert_eq!(config.csm.batch_size, 5);
        assert_eq!(config.csm.max_queue_size, 50);
        assert_eq!(config.csm.flush_interval, Duration::from_secs(60));

        assert_eq!(
            config.placements,
            vec![
                PlacementKey::banner("home-banner", 320, 50),
                PlacementKey::interstitial("level-end", 320, 480),
                PlacementKey::native("feed"),
            ]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_rejects_unknown_format() {
        let toml = r#"
            [[placements]]
            id = "p1"
            width = 1
            height = 1
            format = "video"
        "#;
        assert!(EngineConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = EngineConfig::default();

        config.apply_cli_overrides(
            Some("trace".to_string()),
            Some("B-999".to_string()),
            Some("http://override/cdb".to_string()),
        );

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.publisher.publisher_id, "B-999");
        assert_eq!(config.network.cdb_url, "http://override/cdb");
    }

    #[test]
    fn test_cli_overrides_ignore_empty_publisher() {
        let mut config = valid_config();
        config.apply_cli_overrides(None, Some(String::new()), None);
        assert_eq!(config.publisher.publisher_id, "B-000001");
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_publisher() {
        assert!(EngineConfig::default().validate().is_err());
    }

    #[test]
    fn test_validate_profile_id() {
        let mut config = valid_config();
        config.publisher.profile_id = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = valid_config();
        config.network.timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_csm_sizes() {
        let mut config = valid_config();
        config.csm.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.csm.batch_size = 20;
        config.csm.max_queue_size = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_placements() {
        let mut config = valid_config();
        config.placements = vec![PlacementKey::banner("", 320, 50)];
        assert!(config.validate().is_err());

        config.placements = vec![PlacementKey::new("p1", AdSize::new(0, 50), AdFormat::Banner)];
        assert!(config.validate().is_err());
    }
}
