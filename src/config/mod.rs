//! # Configuration
//!
//! TOML configuration for a mesh session: which device to open, how hard to try delivering a
//! message, how to pace reconnection, and where the node table lives.
//!
//! Every section and field has a default, so an empty file (or a file with just
//! `[device] port = "/dev/ttyACM0"`) is a valid configuration.
//!
//! ```rust,no_run
//! use meshsession::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshsession.toml").await?;
//!     println!("port: {}", config.device.port);
//!     println!("retry every {:?}", config.delivery.retry_interval());
//!     Ok(())
//! }
//! ```
//!
//! ## File format
//!
//! ```toml
//! [device]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [delivery]
//! destination = "broadcast"   # or "!9e9f4220"
//! retry_interval_secs = 10
//! max_attempts = 5
//!
//! [reconnect]
//! min_backoff_ms = 2000
//! max_backoff_ms = 60000
//! multiplier = 2.0
//! ```

use crate::meshtastic::Destination;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Upper bound on a single `open()` attempt.
    pub open_timeout_ms: u64,
    /// Upper bound on a single frame write.
    pub io_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            open_timeout_ms: 5000,
            io_timeout_ms: 2000,
        }
    }
}

impl DeviceConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Defaults applied to every `send_message` unless overridden per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// "broadcast", "!hex", "0xhex" or a decimal node number.
    pub destination: String,
    pub channel: u32,
    pub retry_interval_secs: u64,
    pub max_attempts: u32,
    /// Terminal entries remembered for duplicate-ack handling and status queries.
    pub history_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            destination: "broadcast".to_string(),
            channel: 0,
            retry_interval_secs: 10,
            max_attempts: 5,
            history_limit: 256,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn destination(&self) -> Result<Destination> {
        self.destination
            .parse::<Destination>()
            .map_err(|e| anyhow!("delivery.destination: {}", e))
    }
}

/// Reconnect backoff and link liveness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// How often the open link's `is_alive()` is polled.
    pub liveness_interval_secs: u64,
    /// Reconnect when nothing at all has been received for this long.
    pub stale_timeout_secs: u64,
    /// Heartbeat period while connected (0 disables).
    pub keepalive_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff_ms: 2000,
            max_backoff_ms: 60_000,
            multiplier: 2.0,
            liveness_interval_secs: 5,
            stale_timeout_secs: 300,
            keepalive_interval_secs: 30,
        }
    }
}

impl ReconnectConfig {
    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON node table; empty string disables persistence.
    pub node_cache_file: String,
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            node_cache_file: "data/nodes.json".to_string(),
            flush_interval_secs: 30,
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshsession.log".to_string()),
        }
    }
}

impl Config {
    /// Load and validate configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid config file {}: {}", path, e))?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.delivery.destination()?;
        if self.delivery.max_attempts == 0 {
            bail!("delivery.max_attempts must be at least 1");
        }
        if self.delivery.retry_interval_secs == 0 {
            bail!("delivery.retry_interval_secs must be at least 1");
        }
        if self.reconnect.min_backoff_ms == 0 {
            bail!("reconnect.min_backoff_ms must be positive");
        }
        if self.reconnect.max_backoff_ms < self.reconnect.min_backoff_ms {
            bail!(
                "reconnect.max_backoff_ms ({}) is below min_backoff_ms ({})",
                self.reconnect.max_backoff_ms,
                self.reconnect.min_backoff_ms
            );
        }
        if !(self.reconnect.multiplier >= 1.0 && self.reconnect.multiplier.is_finite()) {
            bail!("reconnect.multiplier must be a finite value >= 1.0");
        }
        if self.reconnect.liveness_interval_secs == 0 {
            bail!("reconnect.liveness_interval_secs must be at least 1");
        }
        if self.device.open_timeout_ms == 0 || self.device.io_timeout_ms == 0 {
            bail!("device timeouts must be positive");
        }
        if self.storage.flush_interval_secs == 0 {
            bail!("storage.flush_interval_secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::NodeId;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.delivery.destination().unwrap(), Destination::Broadcast);
        assert_eq!(config.reconnect.keepalive_interval(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [device]
            port = "/dev/ttyACM0"

            [delivery]
            destination = "!0000002a"
            max_attempts = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.device.port, "/dev/ttyACM0");
        assert_eq!(config.device.baud_rate, 115200);
        assert_eq!(config.delivery.max_attempts, 3);
        assert_eq!(config.delivery.retry_interval_secs, 10);
        assert_eq!(
            config.delivery.destination().unwrap(),
            Destination::Node(NodeId(42))
        );
        assert_eq!(config.storage.flush_interval_secs, 30);
    }

    #[test]
    fn rejects_nonsense_values() {
        let mut config = Config::default();
        config.delivery.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.max_backoff_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.delivery.destination = "nobody".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_keepalive_disables_heartbeat() {
        let mut config = Config::default();
        config.reconnect.keepalive_interval_secs = 0;
        assert_eq!(config.reconnect.keepalive_interval(), None);
    }

    #[tokio::test]
    async fn default_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("meshsession.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.device.port, Config::default().device.port);
        assert_eq!(loaded.delivery.history_limit, 256);
    }
}
