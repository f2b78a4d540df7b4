use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level monitor configuration, loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub monitor: PollingConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub slack: SlackConfig,
}

/// One monitored blockchain network and its BMC contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// BTP network id, e.g. `0x7.icon`
    pub network: String,

    /// Human-readable name; the network id is used when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Adapter kind; only `icon` is supported
    #[serde(rename = "type", default = "default_network_kind")]
    pub kind: String,

    /// JSON-RPC endpoint URL
    pub endpoint: String,

    /// BMC contract address on this network
    pub bmc: String,

    /// Seconds a sent message may stay unacknowledged before this network,
    /// as sender, counts toward a BAD classification
    #[serde(default = "default_seq_limit")]
    pub tx_limit: i64,

    /// Receiver-side counterpart of tx_limit
    #[serde(default = "default_seq_limit")]
    pub rx_limit: i64,

    /// Native coin symbol, for fee tables
    #[serde(default)]
    pub symbol: Option<String>,

    /// Native coin decimals, for fee tables
    #[serde(default = "default_decimal")]
    pub decimal: u32,
}

impl NetworkConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.network.clone())
    }

    /// Full BTP address of this network's BMC
    pub fn address(&self) -> String {
        format!("btp://{}/{}", self.network, self.bmc)
    }

    pub fn symbol(&self) -> String {
        self.symbol.clone().unwrap_or_else(|| {
            match self.kind.as_str() {
                "icon" => "ICX",
                _ => "UNK",
            }
            .to_string()
        })
    }

    /// Berlin testnet placeholder used by the generated config and tests
    pub fn example() -> Self {
        Self {
            network: "0x7.icon".to_string(),
            name: Some("ICON Berlin".to_string()),
            kind: default_network_kind(),
            endpoint: "https://berlin.net.solidwallet.io/api/v3".to_string(),
            bmc: "cxf1b0808f09138fffdb890772315aeabb37072a8a".to_string(),
            tx_limit: default_seq_limit(),
            rx_limit: default_seq_limit(),
            symbol: None,
            decimal: default_decimal(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_enable_wal")]
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path(), enable_wal: default_enable_wal() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Seconds between polling rounds
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_secs: default_interval_secs() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_api_address")]
    pub address: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { enabled: default_true(), address: default_api_address() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: default_true(), address: default_metrics_address() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default = "default_slack_username")]
    pub username: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            channel: None,
            username: default_slack_username(),
        }
    }
}

fn default_network_kind() -> String {
    "icon".to_string()
}

fn default_seq_limit() -> i64 {
    30
}

fn default_decimal() -> u32 {
    18
}

fn default_db_path() -> PathBuf {
    PathBuf::from("btp-monitor.db")
}

fn default_enable_wal() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_slack_username() -> String {
    "BTP Monitor".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            networks: vec![NetworkConfig::example()],
            database: DatabaseConfig::default(),
            monitor: PollingConfig::default(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            slack: SlackConfig::default(),
        }
    }
}

impl MonitorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.networks.is_empty() {
            return Err(ConfigError::Invalid("at least one [[networks]] entry is required".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for network in &self.networks {
            if network.network.is_empty() {
                return Err(ConfigError::Invalid("network id cannot be empty".to_string()));
            }
            if !seen.insert(&network.network) {
                return Err(ConfigError::Invalid(format!("duplicate network id: {}", network.network)));
            }
            if network.endpoint.is_empty() {
                return Err(ConfigError::Invalid(format!("network {}: endpoint cannot be empty", network.network)));
            }
            if network.bmc.is_empty() {
                return Err(ConfigError::Invalid(format!("network {}: bmc cannot be empty", network.network)));
            }
            if network.tx_limit <= 0 || network.rx_limit <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "network {}: tx_limit and rx_limit must be positive",
                    network.network
                )));
            }
        }
        if self.monitor.interval_secs == 0 {
            return Err(ConfigError::Invalid("monitor.interval_secs must be positive".to_string()));
        }
        if self.slack.enabled {
            if self.slack.webhook_url.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid("slack.webhook_url is required when slack is enabled".to_string()));
            }
            if self.slack.channel.as_deref().unwrap_or("").is_empty() {
                return Err(ConfigError::Invalid("slack.channel is required when slack is enabled".to_string()));
            }
        }
        Ok(())
    }

    /// Write a default config to the given path, refusing to overwrite
    pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::Invalid(format!("config file already exists: {}", path.display())));
        }
        Self::default().save_to_file(path)
    }
}
