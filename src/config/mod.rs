//! Configuration Module
//!
//! TOML-based configuration for the sync bridge:
//! - `[sync]`: ports, service name, connection cap
//! - `[heartbeat]`: WebSocket keep-alive timing
//! - `[log]`: log level
//!
//! Environment overrides use the `VISIONSYNC__` prefix with double
//! underscores for nesting (`VISIONSYNC__SYNC__PORT=9000`), and config
//! files may reference environment variables inline with `${VAR}` or
//! `${VAR:-default}`.

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

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

#[cfg(test)]
mod tests;

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
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
    /// Sync service configuration
    pub sync: SyncConfig,
    /// Heartbeat timing
    pub heartbeat: HeartbeatConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Sync service configuration.
///
/// Changes made through [`Config`] mutation take effect at the next
/// service start, never on a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// If false, `start()` returns without binding any port
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Preferred WebSocket port; scanned +10 if busy
    #[serde(default = "default_port")]
    pub port: u16,
    /// Preferred HTTP discovery port; scanned +10 if busy
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Name surfaced in the /discover response
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Hard cap on simultaneous connected sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Consecutive-mistake limit passed to new host tasks.
    /// Absent means unbounded: the remote client is a trusted driver
    /// whose session must not be cut short by the host's anti-runaway
    /// heuristic.
    pub consecutive_mistake_limit: Option<u64>,
}

fn default_enabled() -> bool {
    true
}
fn default_port() -> u16 {
    8765
}
fn default_discovery_port() -> u16 {
    8766
}
fn default_service_name() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "host".to_string());
    format!("RooCode-{}", host)
}
fn default_max_connections() -> usize {
    10
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            service_name: default_service_name(),
            max_connections: default_max_connections(),
            consecutive_mistake_limit: None,
        }
    }
}

/// WebSocket heartbeat timing
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval between server PING frames
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub interval: Duration,
    /// Extra slack past the interval before a silent peer is dropped
    #[serde(with = "humantime_serde", default = "default_heartbeat_grace")]
    pub grace: Duration,
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_heartbeat_grace() -> Duration {
    Duration::from_secs(5)
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: default_heartbeat_interval(),
            grace: default_heartbeat_grace(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in
    ///    the TOML file
    /// 2. Override via env vars: `VISIONSYNC__` prefix with double
    ///    underscores for nesting:
    ///    - `VISIONSYNC__SYNC__PORT=9000` overrides `sync.port`
    ///    - `VISIONSYNC__LOG__LEVEL=debug` overrides `log.level`
    ///
    /// A missing file falls back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("VISIONSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.max_connections == 0 {
            return Err(ConfigError::Validation(
                "sync.max_connections must be at least 1".to_string(),
            ));
        }
        if self.sync.port == 0 || self.sync.discovery_port == 0 {
            return Err(ConfigError::Validation(
                "sync.port and sync.discovery_port must be non-zero".to_string(),
            ));
        }
        if self.sync.port == self.sync.discovery_port {
            return Err(ConfigError::Validation(
                "sync.port and sync.discovery_port must differ".to_string(),
            ));
        }
        if self.heartbeat.interval.is_zero() {
            return Err(ConfigError::Validation(
                "heartbeat.interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
