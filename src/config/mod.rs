//! # Configuration Management Module
//!
//! TOML-backed configuration for the fleet server, with defaults for every
//! value and validation at load time. Missing or invalid configuration is
//! fatal at startup only; nothing in here is consulted again at runtime
//! except through the typed structs handed to each component.
//!
//! ## Configuration File Format
//!
//! ```toml
//! [fleet]
//! name = "Lobby Billboards"
//! location = "HQ"
//!
//! [mqtt]
//! host = "127.0.0.1"
//! port = 1883
//! client_id = "inkfleet-server"
//! qos = 1
//!
//! [playback]
//! poll_interval_secs = 30
//! switch_ahead_secs = 10
//! visitor_play_secs = 120
//! operator_play_secs = 0
//! visitor_daily_limit = 5
//! offline_after_secs = 90
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! file = "inkfleet.log"
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::queue::PlayWindows;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub name: String,
    pub location: String,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            name: "inkfleet".to_string(),
            location: "".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Command QoS level. Commands need at-least-once delivery, so 0 is
    /// bumped to 1 at connect time.
    pub qos: u8,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "inkfleet-server".to_string(),
            username: None,
            password: None,
            qos: 1,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Scheduler tick interval (seconds).
    pub poll_interval_secs: u64,
    /// Advance the slot when its remaining window drops below this (seconds).
    pub switch_ahead_secs: u64,
    /// Visitor play window (seconds).
    pub visitor_play_secs: u64,
    /// Operator play window (seconds); 0 means unbounded.
    pub operator_play_secs: u64,
    /// Distinct content plays a visitor may trigger per UTC day.
    pub visitor_daily_limit: u32,
    /// Mark a device offline after this many seconds of heartbeat silence;
    /// 0 disables the sweep.
    pub offline_after_secs: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            switch_ahead_secs: 10,
            visitor_play_secs: 120,
            operator_play_secs: 0,
            visitor_daily_limit: 5,
            offline_after_secs: 90,
        }
    }
}

impl PlaybackConfig {
    pub fn windows(&self) -> PlayWindows {
        PlayWindows {
            visitor: Duration::from_secs(self.visitor_play_secs),
            operator: (self.operator_play_secs > 0)
                .then(|| Duration::from_secs(self.operator_play_secs)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn switch_ahead(&self) -> Duration {
        Duration::from_secs(self.switch_ahead_secs)
    }

    pub fn offline_after(&self) -> Option<Duration> {
        (self.offline_after_secs > 0).then(|| Duration::from_secs(self.offline_after_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("inkfleet.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file.
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file.
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Startup-time sanity checks. Configuration errors are fatal here and
    /// nowhere else.
    pub fn validate(&self) -> Result<()> {
        if self.playback.poll_interval_secs == 0 {
            return Err(anyhow!("playback.poll_interval_secs must be greater than 0"));
        }
        if self.playback.visitor_play_secs == 0 {
            return Err(anyhow!("playback.visitor_play_secs must be greater than 0"));
        }
        if self.playback.switch_ahead_secs >= self.playback.visitor_play_secs {
            return Err(anyhow!(
                "playback.switch_ahead_secs ({}) must be shorter than visitor_play_secs ({})",
                self.playback.switch_ahead_secs,
                self.playback.visitor_play_secs
            ));
        }
        if self.mqtt.qos > 2 {
            return Err(anyhow!("mqtt.qos must be 0, 1 or 2"));
        }
        if self.mqtt.host.is_empty() {
            return Err(anyhow!("mqtt.host must not be empty"));
        }
        if self.storage.data_dir.is_empty() {
            return Err(anyhow!("storage.data_dir must not be empty"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fleet: FleetConfig::default(),
            mqtt: MqttConfig::default(),
            playback: PlaybackConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.playback.poll_interval_secs, 30);
        assert_eq!(config.playback.visitor_daily_limit, 5);
        assert_eq!(config.mqtt.qos, 1);
    }

    #[test]
    fn operator_window_zero_means_unbounded() {
        let playback = PlaybackConfig::default();
        let windows = playback.windows();
        assert!(windows.operator.is_none());
        assert_eq!(windows.visitor, Duration::from_secs(120));

        let bounded = PlaybackConfig {
            operator_play_secs: 600,
            ..PlaybackConfig::default()
        };
        assert_eq!(bounded.windows().operator, Some(Duration::from_secs(600)));
    }

    #[test]
    fn offline_sweep_can_be_disabled() {
        let playback = PlaybackConfig {
            offline_after_secs: 0,
            ..PlaybackConfig::default()
        };
        assert!(playback.offline_after().is_none());
        assert_eq!(
            PlaybackConfig::default().offline_after(),
            Some(Duration::from_secs(90))
        );
    }

    #[test]
    fn rejects_inconsistent_playback_settings() {
        let mut config = Config::default();
        config.playback.switch_ahead_secs = 200;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.playback.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mqtt.qos = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [mqtt]
            host = "broker.internal"
            port = 8883
            client_id = "inkfleet-test"
            qos = 2
            keep_alive_secs = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.host, "broker.internal");
        assert_eq!(config.mqtt.qos, 2);
        assert_eq!(config.playback.visitor_play_secs, 120);
        assert_eq!(config.storage.data_dir, "./data");
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.playback.poll_interval_secs, config.playback.poll_interval_secs);
        assert_eq!(parsed.mqtt.client_id, config.mqtt.client_id);
    }
}
