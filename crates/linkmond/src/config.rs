//! Daemon configuration.
//!
//! Loaded from a TOML file (default `/etc/routelink/linkmond.conf`) with
//! per-field defaults, then validated once at startup. Validation failures
//! abort startup; the process supervisor is expected to surface them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{LinkMonitorError, Result};
use crate::types::{PrefixForwardingAlgorithm, PrefixForwardingType};

/// KV store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// KV store host
    #[serde(default = "default_kv_host")]
    pub host: String,

    /// KV store port
    #[serde(default = "default_kv_port")]
    pub port: u16,

    /// TTL for keys this daemon persists, in milliseconds
    #[serde(default = "default_kv_key_ttl_ms")]
    pub key_ttl_ms: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            host: default_kv_host(),
            port: default_kv_port(),
            key_ttl_ms: default_kv_key_ttl_ms(),
        }
    }
}

/// One routing area: id plus membership regexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Area identifier
    pub id: String,

    /// Regexes a neighbor's node name must match to join the area
    #[serde(default = "default_match_all")]
    pub neighbor_regexes: Vec<String>,

    /// Regexes a local interface must match to form adjacencies in the area
    #[serde(default = "default_match_all")]
    pub interface_regexes: Vec<String>,
}

impl Default for AreaConfig {
    fn default() -> Self {
        Self {
            id: "0".to_string(),
            neighbor_regexes: default_match_all(),
            interface_regexes: default_match_all(),
        }
    }
}

/// Complete linkmond configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this node; used to build KV key names. Required.
    #[serde(default)]
    pub node_id: String,

    /// Routing domain identifier
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Advertise IPv4 addresses and prefixes
    #[serde(default = "default_true")]
    pub enable_v4: bool,

    /// Enable segment-routing label allocation
    #[serde(default)]
    pub enable_segment_routing: bool,

    /// Forwarding type stamped on redistributed prefixes
    #[serde(default)]
    pub prefix_forwarding_type: PrefixForwardingType,

    /// Path algorithm stamped on redistributed prefixes
    #[serde(default)]
    pub prefix_forwarding_algorithm: PrefixForwardingAlgorithm,

    /// Derive adjacency metrics from measured round-trip times
    #[serde(default = "default_true")]
    pub use_rtt_metric: bool,

    /// Initial link-flap backoff in milliseconds
    #[serde(default = "default_linkflap_init_backoff_ms")]
    pub linkflap_init_backoff_ms: u64,

    /// Maximum link-flap backoff in milliseconds
    #[serde(default = "default_linkflap_max_backoff_ms")]
    pub linkflap_max_backoff_ms: u64,

    /// Advertisement coalescing window in milliseconds
    #[serde(default = "default_advertise_throttle_ms")]
    pub advertise_throttle_ms: u64,

    /// Period of the full link/address resync from the platform, in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Delay before the first adjacency/peer publication, in seconds
    #[serde(default = "default_adj_hold_time_secs")]
    pub adj_hold_time_secs: u64,

    /// Interfaces to monitor; empty means all
    #[serde(default)]
    pub include_interface_regexes: Vec<String>,

    /// Interfaces to ignore even when included
    #[serde(default)]
    pub exclude_interface_regexes: Vec<String>,

    /// Interfaces whose addresses are redistributed into the routing domain
    #[serde(default)]
    pub redistribute_interface_regexes: Vec<String>,

    /// Routing areas; at least one is required
    #[serde(default = "default_areas")]
    pub areas: Vec<AreaConfig>,

    /// Drain state assumed when none is persisted
    #[serde(default)]
    pub assume_drained: bool,

    /// Force the drain state to `assume_drained`, overwriting persisted state
    #[serde(default)]
    pub override_drain_state: bool,

    /// Path of the persisted operator-state blob
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// KV store settings
    #[serde(default)]
    pub kv: KvConfig,
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl Config {
    /// Loads the configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LinkMonitorError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            LinkMonitorError::Config(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates self-consistency. Called once at startup; failure is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(LinkMonitorError::Config("node_id must be set".to_string()));
        }
        if self.linkflap_init_backoff_ms > self.linkflap_max_backoff_ms {
            return Err(LinkMonitorError::Config(format!(
                "linkflap_init_backoff_ms ({}) exceeds linkflap_max_backoff_ms ({})",
                self.linkflap_init_backoff_ms, self.linkflap_max_backoff_ms
            )));
        }
        if self.areas.is_empty() {
            return Err(LinkMonitorError::Config(
                "at least one area must be configured".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for area in &self.areas {
            if !seen.insert(area.id.as_str()) {
                return Err(LinkMonitorError::Config(format!(
                    "duplicate area id: {}",
                    area.id
                )));
            }
        }
        for pattern in self
            .include_interface_regexes
            .iter()
            .chain(&self.exclude_interface_regexes)
            .chain(&self.redistribute_interface_regexes)
            .chain(self.areas.iter().flat_map(|a| &a.neighbor_regexes))
            .chain(self.areas.iter().flat_map(|a| &a.interface_regexes))
        {
            regex::Regex::new(pattern).map_err(|e| {
                LinkMonitorError::Config(format!("invalid regex {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }

    /// Initial link-flap backoff.
    pub fn linkflap_init_backoff(&self) -> Duration {
        Duration::from_millis(self.linkflap_init_backoff_ms)
    }

    /// Maximum link-flap backoff.
    pub fn linkflap_max_backoff(&self) -> Duration {
        Duration::from_millis(self.linkflap_max_backoff_ms)
    }

    /// Advertisement coalescing window.
    pub fn advertise_throttle(&self) -> Duration {
        Duration::from_millis(self.advertise_throttle_ms)
    }

    /// Full resync period.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Initial adjacency hold duration.
    pub fn adj_hold_time(&self) -> Duration {
        Duration::from_secs(self.adj_hold_time_secs)
    }

    /// TTL applied to keys persisted in the KV store.
    pub fn kv_key_ttl(&self) -> Duration {
        Duration::from_millis(self.kv.key_ttl_ms)
    }

    /// Returns the configured area ids.
    pub fn area_ids(&self) -> Vec<String> {
        self.areas.iter().map(|a| a.id.clone()).collect()
    }

    /// Returns true when `area` is configured.
    pub fn has_area(&self, area: &str) -> bool {
        self.areas.iter().any(|a| a.id == area)
    }
}

fn default_kv_host() -> String {
    "127.0.0.1".to_string()
}

fn default_kv_port() -> u16 {
    6379
}

fn default_kv_key_ttl_ms() -> u64 {
    300_000
}

fn default_domain() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_linkflap_init_backoff_ms() -> u64 {
    1_000
}

fn default_linkflap_max_backoff_ms() -> u64 {
    60_000
}

fn default_advertise_throttle_ms() -> u64 {
    20
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_adj_hold_time_secs() -> u64 {
    4
}

fn default_match_all() -> Vec<String> {
    vec![".*".to_string()]
}

fn default_areas() -> Vec<AreaConfig> {
    vec![AreaConfig::default()]
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/routelink/linkmond-state.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            node_id: "N1".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.domain, "default");
        assert!(config.enable_v4);
        assert!(config.use_rtt_metric);
        assert_eq!(config.linkflap_init_backoff(), Duration::from_secs(1));
        assert_eq!(config.linkflap_max_backoff(), Duration::from_secs(60));
        assert_eq!(config.areas.len(), 1);
        assert_eq!(config.areas[0].id, "0");
        assert_eq!(config.kv.port, 6379);
    }

    #[test]
    fn test_validate_requires_node_id() {
        let config = Config::default();
        assert!(config.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_backoff_ordering() {
        let mut config = valid_config();
        config.linkflap_init_backoff_ms = 120_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_areas() {
        let mut config = valid_config();
        config.areas.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_areas() {
        let mut config = valid_config();
        config.areas.push(AreaConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = valid_config();
        config.include_interface_regexes = vec!["et[".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let toml_str = r#"
            node_id = "N1"
            include_interface_regexes = ["et.*"]
            assume_drained = true

            [[areas]]
            id = "0"
            neighbor_regexes = ["rsw.*"]

            [kv]
            host = "::1"
            port = 6380
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node_id, "N1");
        assert!(config.assume_drained);
        assert_eq!(config.kv.host, "::1");
        assert_eq!(config.kv.port, 6380);
        assert_eq!(config.areas[0].neighbor_regexes, vec!["rsw.*".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_has_area() {
        let config = valid_config();
        assert!(config.has_area("0"));
        assert!(!config.has_area("1"));
    }
}
