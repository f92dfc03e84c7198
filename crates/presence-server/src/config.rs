//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - The file named by `PRESENCE_CONFIG`, else the first TOML file found in
//!   [`CONFIG_PATHS`]
//! - Environment variables (`PRESENCE__PORT`, `PRESENCE__STORAGE__BACKEND`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_presence_core::PresenceOptions;

/// Searched in order; the first existing file wins.
pub const CONFIG_PATHS: [&str; 3] = [
    "presence.toml",
    "/etc/presence/presence.toml",
    "~/.config/presence/presence.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Presence tuning; invalid values fall back to defaults.
    #[serde(default)]
    pub presence: PresenceOptions,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where presence state lives.
///
/// Production deployments must use [`StorageBackend::Redis`]: presence is
/// shared across instances and `Memory` keeps state inside one process.
/// `Memory` is the default so a single `presenced` runs without external
/// services during development and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local; development and single-instance use only.
    #[default]
    Memory,
    /// Shared across instances.
    Redis,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key this service writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Time allowed for the `Connect` frame after upgrade.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Ping interval advertised to clients in `Connected`.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Deadline for each store-backed operation.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "presence".to_string()
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_ping_interval() -> u64 {
    30_000 // well inside the default 120s heartbeat TTL
}

fn default_operation_timeout() -> u64 {
    2_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            presence: PresenceOptions::default(),
            storage: StorageConfig::default(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            connect_timeout_ms: default_connect_timeout(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: default_operation_timeout(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `PRESENCE_CONFIG` or the first config file
    /// found, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("PRESENCE_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref())
    }

    /// Load configuration from a specific file, with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::layered(Some(path.as_ref()))
    }

    fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("PRESENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?;

        let config: Config = settings.try_deserialize().with_context(|| match file {
            Some(path) => format!("Failed to parse config file: {}", path.display()),
            None => "Failed to parse configuration from environment".to_string(),
        })?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.operation_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.presence.normalize().heartbeat_ttl_seconds, 120);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [presence]
            heartbeat_ttl_seconds = 90
            offline_grace_seconds = -5

            [storage]
            backend = "redis"
            redis_url = "redis://cache:6379/2"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.storage.backend, StorageBackend::Redis);
        assert_eq!(config.storage.key_prefix, "presence");

        let presence = config.presence.normalize();
        assert_eq!(presence.heartbeat_ttl_seconds, 90);
        assert_eq!(presence.offline_grace_seconds, 60);
    }

    #[test]
    fn test_config_from_file() {
        let path = std::env::temp_dir().join(format!(
            "presence-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "port = 7070\n[limits]\noperation_timeout_ms = 250\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.port, 7070);
        assert_eq!(config.operation_timeout(), Duration::from_millis(250));
        assert_eq!(config.limits.max_message_size, 64 * 1024);
    }
}
