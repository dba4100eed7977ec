//! Configuration module
//!
//! TOML-based configuration with environment variable overrides
//! (`WRENMQ_*` prefix) and `${VAR}` / `${VAR:-default}` substitution inside
//! the file. CLI flags override the file, the file overrides defaults.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::BrokerConfig;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading the config file
    Io(std::io::Error),
    /// Config crate error (parse, env, deserialize)
    Config(config::ConfigError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// MQTT behavior flags
    pub mqtt: MqttConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:1883".parse().unwrap(),
        }
    }
}

/// Connection limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum accepted packet size in bytes
    pub max_packet_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let defaults = BrokerConfig::default();
        Self {
            max_connections: defaults.max_connections,
            max_packet_size: defaults.max_packet_size,
        }
    }
}

/// MQTT behavior flags
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Withhold inbound QoS 2 publications until PUBREL arrives
    pub publish_on_pubrel: bool,
    /// Deliver one copy per client on overlapping subscriptions
    pub overlapping_single: bool,
    /// Drop QoS 0 publications destined for a disconnected session
    pub drop_qos0: bool,
    /// Keepalive sweep interval (e.g. "1s", "500ms")
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        let defaults = BrokerConfig::default();
        Self {
            publish_on_pubrel: defaults.publish_on_pubrel,
            overlapping_single: defaults.overlapping_single,
            drop_qos0: defaults.drop_qos0,
            sweep_interval: defaults.sweep_interval,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        let cfg = config::Config::builder()
            .add_source(File::from_str(&content, FileFormat::Toml))
            .add_source(Environment::with_prefix("WRENMQ").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Build configuration from environment variables and defaults only
    pub fn from_env() -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(Environment::with_prefix("WRENMQ").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Convert into the broker's runtime configuration
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            bind_addr: self.server.bind,
            max_connections: self.limits.max_connections,
            max_packet_size: self.limits.max_packet_size,
            sweep_interval: self.mqtt.sweep_interval,
            publish_on_pubrel: self.mqtt.publish_on_pubrel,
            overlapping_single: self.mqtt.overlapping_single,
            drop_qos0: self.mqtt.drop_qos0,
        }
    }
}
