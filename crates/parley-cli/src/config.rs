//! Configuration system for the Parley CLI.

use parley_broker::{BrokerConfig, GatheringPolicy, RtcConfig, transport::DEFAULT_STUN_SERVERS};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Parley configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay server configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Broker (client) configuration
    #[serde(default)]
    pub broker: BrokerSection,
    /// ICE configuration
    #[serde(default)]
    pub ice: IceSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Delay before pushing `Welcome` to a new connection
    #[serde(default = "default_welcome_delay_ms")]
    pub welcome_delay_ms: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    /// Relay WebSocket URL
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Application protocol tag
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// How long `connect` waits for the host to answer
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Bound on relay requests, unbounded when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Relay latency probe interval
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// How long an accepted connection may take to open
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
}

/// ICE configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceSection {
    /// STUN server URLs
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_welcome_delay_ms() -> u64 {
    16
}

fn default_max_peers() -> usize {
    parley_relay::DEFAULT_MAX_PEERS
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:3000/".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_ping_interval_ms() -> u64 {
    5000
}

fn default_accept_timeout_ms() -> u64 {
    30_000
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(ToString::to_string).collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            welcome_delay_ms: default_welcome_delay_ms(),
            max_peers: default_max_peers(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            protocol: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            ping_interval_ms: default_ping_interval_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
        }
    }
}

impl Default for IceSection {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid configuration TOML.
    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("parley/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.relay.listen_addr.parse()?)
    }

    /// Parse the relay URL
    ///
    /// # Errors
    ///
    /// Returns an error unless the URL is a `ws` or `wss` URL.
    pub fn relay_url(&self) -> anyhow::Result<Url> {
        parse_relay_url(&self.broker.relay_url)
    }

    /// Relay server settings
    #[must_use]
    pub fn relay_config(&self) -> parley_relay::RelayConfig {
        parley_relay::RelayConfig {
            welcome_delay: Duration::from_millis(self.relay.welcome_delay_ms),
            max_peers: self.relay.max_peers,
        }
    }

    /// Broker settings
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            protocol: self.broker.protocol.clone(),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            request_timeout: self.broker.request_timeout_ms.map(Duration::from_millis),
            ping_interval: Duration::from_millis(self.broker.ping_interval_ms),
            accept_timeout: Duration::from_millis(self.broker.accept_timeout_ms),
            rtc: RtcConfig::with_stun_servers(self.ice.stun_servers.iter().cloned()),
            policy: GatheringPolicy::new(),
            ..BrokerConfig::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.relay_url()?;

        if self.relay.max_peers == 0 {
            anyhow::bail!("max_peers must be at least 1");
        }
        if self.relay.welcome_delay_ms > 10_000 {
            anyhow::bail!("welcome_delay_ms must be at most 10000");
        }

        if self.broker.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be positive");
        }
        if self.broker.request_timeout_ms == Some(0) {
            anyhow::bail!("request_timeout_ms must be positive when set");
        }
        if self.broker.ping_interval_ms < 100 {
            anyhow::bail!("ping_interval_ms must be at least 100");
        }
        if self.broker.accept_timeout_ms == 0 {
            anyhow::bail!("accept_timeout_ms must be positive");
        }

        for server in &self.ice.stun_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:")) {
                anyhow::bail!("ICE server '{server}' must start with stun: or turn:");
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

/// Parse a relay WebSocket URL
///
/// # Errors
///
/// Returns an error unless the URL parses and uses `ws` or `wss`.
pub fn parse_relay_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid relay URL '{raw}': {e}"))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => anyhow::bail!("Relay URL '{raw}' has scheme {other}, expected ws or wss"),
    }
    if url.host_str().is_none() {
        anyhow::bail!("Relay URL '{raw}' has no host");
    }
    Ok(url)
}
