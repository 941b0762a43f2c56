//! Configuration Module
//!
//! Provides TOML-based configuration for VibeMQ with support for:
//! - Server settings (bind address, workers)
//! - Connection limits
//! - Session parameters
//! - MQTT feature flags
//! - Authentication
//! - Persistence
//! - Environment variable overrides (VIBEMQ_* prefix)

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

// Re-export metrics config types
pub use metrics::MetricsConfig;

// Re-export persistence config types
pub use persistence::{BackendType, PersistenceConfig};

mod metrics;
mod persistence;

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
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Server configuration
    pub server: ServerConfig,
    /// Connection limits
    pub limits: LimitsConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Authentication configuration
    pub auth: AuthConfig,
    /// Persistence configuration
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
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

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Number of worker threads (0 = auto)
    #[serde(default)]
    pub workers: usize,
}

fn default_bind() -> SocketAddr {
    "0.0.0.0:1883".parse().unwrap()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            workers: 0,
        }
    }
}

/// Connection limits configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Maximum queued messages per offline client
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Seconds between resends of unacknowledged QoS 1/2 messages
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Whether every outbound write is followed by an explicit socket flush
    #[serde(default)]
    pub immediate_buffer_flush: bool,
}

fn default_max_connections() -> usize {
    100_000
}
fn default_max_packet_size() -> usize {
    1024 * 1024
}
fn default_max_queued_messages() -> usize {
    1000
}
fn default_retry_interval() -> u64 {
    5
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packet_size: default_max_packet_size(),
            max_queued_messages: default_max_queued_messages(),
            retry_interval: default_retry_interval(),
            immediate_buffer_flush: false,
        }
    }
}

impl LimitsConfig {
    /// Get retry interval as Duration
    pub fn retry_interval_duration(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Default keep alive in seconds
    #[serde(default = "default_keep_alive")]
    pub default_keep_alive: u16,
    /// Maximum keep alive in seconds (0 = unbounded)
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
}

fn default_keep_alive() -> u16 {
    60
}
fn default_max_keep_alive() -> u16 {
    0
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_keep_alive: default_keep_alive(),
            max_keep_alive: default_max_keep_alive(),
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Maximum number of levels in a topic name or filter (0 = unlimited)
    #[serde(default)]
    pub max_topic_levels: usize,
    /// Accept CONNECT with a zero-byte client identifier (server assigns one)
    #[serde(default = "default_true")]
    pub allow_zero_byte_client_id: bool,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            max_topic_levels: 0,
            allow_zero_byte_client_id: true,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Whether authentication is enabled
    pub enabled: bool,
    /// Allow anonymous connections when auth is enabled
    #[serde(default = "default_true")]
    pub allow_anonymous: bool,
    /// Static user list
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// User configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username
    pub username: String,
    /// Password hash (argon2 PHC format: $argon2id$v=19$...)
    pub password_hash: String,
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEMQ__` prefix with double underscores for nesting:
    ///    - `VIBEMQ__SERVER__BIND=0.0.0.0:1884` overrides `server.bind`
    ///    - `VIBEMQ__LIMITS__MAX_CONNECTIONS=50000` overrides `limits.max_connections`
    ///    - `VIBEMQ__AUTH__ENABLED=true` overrides `auth.enabled`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:1883")?
            .set_default("server.workers", 0)?
            .set_default("limits.max_connections", 100_000)?
            .set_default("limits.max_packet_size", 1024 * 1024)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.retry_interval", 5)?
            .set_default("limits.immediate_buffer_flush", false)?
            .set_default("session.default_keep_alive", 60)?
            .set_default("session.max_keep_alive", 0)?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.max_topic_levels", 0)?
            .set_default("mqtt.allow_zero_byte_client_id", true)?
            .set_default("auth.enabled", false)?
            .set_default("auth.allow_anonymous", true)?
            .set_default("persistence.enabled", true)?
            .set_default("persistence.path", "./data")?
            .set_default("persistence.flush_interval_ms", 100)?
            .set_default("persistence.max_batch_size", 100)?;

        // Load from file with env var substitution
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

        // Override with environment variables (VIBEMQ__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
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
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }

        if self.auth.enabled {
            for user in &self.auth.users {
                if user.password_hash.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has an empty password_hash",
                        user.username
                    )));
                }
                if !user.password_hash.starts_with("$argon2") {
                    return Err(ConfigError::Validation(format!(
                        "User '{}' has invalid password_hash format (must be argon2 PHC format)",
                        user.username
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build a user lookup map for efficient auth checks
    pub fn build_user_map(&self) -> HashMap<String, &UserConfig> {
        self.auth
            .users
            .iter()
            .map(|user| (user.username.clone(), user))
            .collect()
    }
}
