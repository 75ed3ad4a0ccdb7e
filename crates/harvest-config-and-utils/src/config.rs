//! Configuration management for the harvester.

use crate::{CoreError, CoreResult, DeviceClass, Paths, Profile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default collector region.
pub const DEFAULT_REGION: &str = "US";

/// Agent name reported in the device descriptor.
pub const AGENT_NAME: &str = "video-harvest";

/// Agent version reported in the device descriptor.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main harvester configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Application license token used to obtain data tokens.
    #[serde(default)]
    pub application_token: String,
    /// Collector region code (US, EU).
    #[serde(default = "default_region")]
    pub region: String,
    /// Device class used to pick the tuning profile.
    #[serde(default)]
    pub device_class: DeviceClass,
    /// Back events up to the durable store and recover after crashes.
    #[serde(default = "default_true")]
    pub crash_safety: bool,
    /// Full collector URL that bypasses the regional endpoint table.
    #[serde(default)]
    pub collector_endpoint: Option<String>,
    /// Full token connect URL that bypasses the regional default.
    #[serde(default)]
    pub connect_endpoint: Option<String>,
    /// Identity of the instrumented application.
    #[serde(default)]
    pub app: AppIdentity,
    /// Identity of the device.
    #[serde(default)]
    pub device: DeviceIdentity,
    /// Per-field profile overrides.
    #[serde(default)]
    pub overrides: ProfileOverrides,
}

/// Instrumented application identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppIdentity {
    pub name: String,
    pub version: String,
    pub package: String,
}

impl Default for AppIdentity {
    fn default() -> Self {
        Self {
            name: "video-harvest".to_string(),
            version: AGENT_VERSION.to_string(),
            package: "video.harvest".to_string(),
        }
    }
}

/// Device identity reported with every payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceIdentity {
    pub os_name: String,
    pub os_version: String,
    pub architecture: String,
    pub model: String,
    pub manufacturer: String,
    /// Stable per-install identifier. Generated on first run when empty.
    pub device_id: String,
    /// Screen size class (small, normal, large, xlarge, tv).
    pub form_factor: String,
    pub platform: String,
    pub platform_version: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            os_name: std::env::consts::OS.to_string(),
            os_version: String::new(),
            architecture: std::env::consts::ARCH.to_string(),
            model: String::new(),
            manufacturer: String::new(),
            device_id: String::new(),
            form_factor: "normal".to_string(),
            platform: "native".to_string(),
            platform_version: AGENT_VERSION.to_string(),
        }
    }
}

/// Optional overrides applied on top of the device preset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    /// On-demand harvest interval in seconds.
    pub harvest_cycle_secs: Option<u64>,
    /// Live harvest interval in seconds.
    pub live_harvest_cycle_secs: Option<u64>,
    /// Dead-letter queue capacity.
    pub max_dead_letter_size: Option<usize>,
    /// Collapse consecutive repeated `actionName` events when polling.
    pub collapse_repeated_actions: Option<bool>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            application_token: String::new(),
            region: DEFAULT_REGION.to_string(),
            device_class: DeviceClass::default(),
            crash_safety: true,
            collector_endpoint: None,
            connect_endpoint: None,
            app: AppIdentity::default(),
            device: DeviceIdentity::default(),
            overrides: ProfileOverrides::default(),
        }
    }
}

impl HarvestConfig {
    /// Defaults, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load `<base>/config.json` if present, then apply environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: HarvestConfig =
            serde_json::from_str(&content).map_err(|source| CoreError::MalformedConfig {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config)
    }

    /// Save configuration to `<base>/config.json`.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(level) = lookup("VIDEO_HARVEST_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(token) = lookup("VIDEO_HARVEST_APP_TOKEN") {
            self.application_token = token;
        }
        if let Some(region) = lookup("VIDEO_HARVEST_REGION") {
            self.region = region.to_ascii_uppercase();
        }
        if let Some(profile) = lookup("VIDEO_HARVEST_PROFILE") {
            match profile.to_ascii_lowercase().as_str() {
                "tv" => self.device_class = DeviceClass::Tv,
                "mobile" => self.device_class = DeviceClass::Mobile,
                other => tracing::warn!(profile = other, "Ignoring unknown profile override"),
            }
        }
        if let Some(endpoint) = lookup("VIDEO_HARVEST_ENDPOINT") {
            self.collector_endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
    }

    /// Fill in a random device id if none is configured.
    ///
    /// Returns true when an id was generated, so callers can persist it.
    pub fn ensure_device_id(&mut self) -> bool {
        if !self.device.device_id.is_empty() {
            return false;
        }
        self.device.device_id = uuid::Uuid::new_v4().to_string();
        true
    }

    /// Build the tuning profile: device preset plus overrides.
    pub fn profile(&self) -> Profile {
        let mut profile = Profile::for_device(self.device_class);
        if let Some(secs) = self.overrides.harvest_cycle_secs {
            profile.on_demand_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = self.overrides.live_harvest_cycle_secs {
            profile.live_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = self.overrides.max_dead_letter_size {
            profile.dead_letter_capacity = size.max(1);
        }
        if let Some(collapse) = self.overrides.collapse_repeated_actions {
            profile.collapse_repeated_actions = collapse;
        }
        profile
    }

    /// Parsed collector override, if configured.
    pub fn collector_endpoint_url(&self) -> CoreResult<Option<Url>> {
        self.collector_endpoint
            .as_deref()
            .map(parse_http_url)
            .transpose()
    }

    /// Parsed connect override, if configured.
    pub fn connect_endpoint_url(&self) -> CoreResult<Option<Url>> {
        self.connect_endpoint
            .as_deref()
            .map(parse_http_url)
            .transpose()
    }
}

fn parse_http_url(raw: &str) -> CoreResult<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(CoreError::UnsupportedScheme(scheme.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = HarvestConfig::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.region, "US");
        assert_eq!(config.device_class, DeviceClass::Mobile);
        assert!(config.crash_safety);
        assert!(config.collector_endpoint.is_none());
    }

    #[test]
    fn test_malformed_config_file_is_reported() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, "{ \"log_level\": ").unwrap();

        match HarvestConfig::load_from_file(&config_path) {
            Err(CoreError::MalformedConfig { path, .. }) => assert_eq!(path, config_path),
            other => panic!("expected MalformedConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_config_load_from_file_partial() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{
                "log_level": "debug",
                "device_class": "tv",
                "overrides": { "harvest_cycle_secs": 30 }
            }"#,
        )
        .unwrap();

        let config = HarvestConfig::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.device_class, DeviceClass::Tv);
        assert_eq!(config.region, "US");
        assert!(config.crash_safety);

        let profile = config.profile();
        assert!(profile.is_tv());
        assert_eq!(profile.on_demand_interval, Duration::from_secs(30));
        assert_eq!(profile.live_interval, Duration::from_secs(45));
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let mut config = HarvestConfig::default();
        config.application_token = "license-abc".to_string();
        config.device.device_id = "device-1".to_string();
        config.save(&paths).unwrap();

        let loaded = HarvestConfig::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(loaded.application_token, "license-abc");
        assert_eq!(loaded.device.device_id, "device-1");
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = HarvestConfig::load(&paths).unwrap();
        assert!(config.crash_safety);
    }

    #[test]
    fn test_apply_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VIDEO_HARVEST_LOG_LEVEL", "trace"),
            ("VIDEO_HARVEST_REGION", "eu"),
            ("VIDEO_HARVEST_PROFILE", "TV"),
            ("VIDEO_HARVEST_ENDPOINT", "http://localhost:9000/events"),
        ]
        .into_iter()
        .collect();

        let mut config = HarvestConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.region, "EU");
        assert_eq!(config.device_class, DeviceClass::Tv);
        assert_eq!(
            config.collector_endpoint_url().unwrap().unwrap().as_str(),
            "http://localhost:9000/events"
        );
    }

    #[test]
    fn test_apply_env_ignores_unknown_profile() {
        let mut config = HarvestConfig::default();
        config.apply_env(|key| (key == "VIDEO_HARVEST_PROFILE").then(|| "fridge".to_string()));
        assert_eq!(config.device_class, DeviceClass::Mobile);
    }

    #[test]
    fn test_collector_endpoint_rejects_other_schemes() {
        let mut config = HarvestConfig::default();
        config.collector_endpoint = Some("ftp://example.com/events".to_string());
        assert!(matches!(
            config.collector_endpoint_url(),
            Err(CoreError::UnsupportedScheme(_))
        ));

        config.collector_endpoint = Some("not a url".to_string());
        assert!(matches!(
            config.collector_endpoint_url(),
            Err(CoreError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_ensure_device_id_generates_once() {
        let mut config = HarvestConfig::default();
        assert!(config.ensure_device_id());
        let first = config.device.device_id.clone();
        assert!(!first.is_empty());
        assert!(!config.ensure_device_id());
        assert_eq!(config.device.device_id, first);
    }

    #[test]
    fn test_profile_overrides_clamp_to_minimum() {
        let mut config = HarvestConfig::default();
        config.overrides.max_dead_letter_size = Some(0);
        config.overrides.live_harvest_cycle_secs = Some(0);
        config.overrides.collapse_repeated_actions = Some(true);

        let profile = config.profile();
        assert_eq!(profile.dead_letter_capacity, 1);
        assert_eq!(profile.live_interval, Duration::from_secs(1));
        assert!(profile.collapse_repeated_actions);
    }
}
