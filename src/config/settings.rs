//! Engine settings

use crate::core::capture::CaptureFormat;
use crate::core::channel::ChannelOptions;
use crate::core::device::TimestampMode;
use crate::core::session::SessionOptions;
use crate::core::wireless::{DEFAULT_SOFTWARE_RETRIES, MAX_SOFTWARE_RETRIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";

/// Configuration load/save errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value: {0}")]
    Invalid(String),
}

/// Engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Serial port settings
    pub serial: SerialSettings,
    /// Command timing and retries
    pub commands: CommandSettings,
    /// Streaming settings
    pub streaming: StreamSettings,
    /// Reconnect supervisor settings
    pub reconnect: ReconnectSettings,
    /// Logging settings
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Load from the platform config directory; defaults when absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join(CONFIG_FILE);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to the platform config directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = super::config_dir().ok_or(ConfigError::NoConfigDir)?;
        std::fs::create_dir_all(&dir)?;
        self.save_to(&dir.join(CONFIG_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the engine cannot honor
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.commands.software_retries > MAX_SOFTWARE_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "software_retries must be at most {MAX_SOFTWARE_RETRIES}"
            )));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("baud_rate must be non-zero".into()));
        }
        if self.streaming.queue_capacity == 0 || self.streaming.subscriber_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".into()));
        }
        Ok(())
    }

    /// Options for each transport channel
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            poll_interval: Duration::from_millis(self.streaming.poll_interval_ms.max(1)),
            settle: Duration::from_millis(self.serial.settle_ms),
            stream_queue: self.streaming.queue_capacity,
            late_reply_grace: Duration::from_millis(self.commands.late_reply_grace_ms),
        }
    }

    /// Options for each device session
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            command_timeout: Duration::from_millis(self.commands.timeout_ms),
            wireless_timeout: Duration::from_millis(self.commands.wireless_timeout_ms),
            timestamp_mode: self.streaming.timestamp_mode,
            subscriber_capacity: self.streaming.subscriber_capacity,
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Pause after enabling response headers, before draining (ms)
    pub settle_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            settle_ms: 100,
        }
    }
}

/// Command timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Wired response timeout (ms)
    pub timeout_ms: u64,
    /// Per-attempt wireless response timeout (ms)
    pub wireless_timeout_ms: u64,
    /// Host-side resends of a timed-out wireless command
    pub software_retries: u8,
    /// After a timeout, a reply to the same command within this window is
    /// treated as the late reply (ms, 0 disables)
    pub late_reply_grace_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            wireless_timeout_ms: 200,
            software_retries: DEFAULT_SOFTWARE_RETRIES,
            late_reply_grace_ms: 250,
        }
    }
}

/// Streaming settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Batches buffered between delivery and dispatch, per channel
    pub queue_capacity: usize,
    /// Batches buffered per subscriber
    pub subscriber_capacity: usize,
    pub timestamp_mode: TimestampMode,
    /// Delivery thread poll interval (ms)
    pub poll_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            subscriber_capacity: 256,
            timestamp_mode: TimestampMode::Sensor,
            poll_interval_ms: 5,
        }
    }
}

/// Reconnect supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// Delay between attempts (ms)
    pub delay_ms: u64,
    /// Attempts before giving up (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 2000,
            max_attempts: 0,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Also write a daily rolling log file
    pub file: bool,
    /// Log directory; platform default when unset
    pub directory: Option<PathBuf>,
    /// Emit JSON instead of text
    pub json: bool,
    /// Capture format for traffic logs
    pub capture_format: CaptureFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: false,
            directory: None,
            json: false,
            capture_format: CaptureFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.commands.timeout_ms, 1000);
        assert_eq!(config.commands.software_retries, 3);
        assert_eq!(config.streaming.queue_capacity, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = EngineConfig::default();
        config.serial.baud_rate = 921_600;
        config.commands.software_retries = 7;
        config.streaming.timestamp_mode = TimestampMode::System;
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[commands]\ntimeout_ms = 250\n").unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.commands.timeout_ms, 250);
        assert_eq!(loaded.commands.software_retries, 3);
        assert_eq!(loaded.serial.baud_rate, 115_200);
    }

    #[test]
    fn test_rejects_excess_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[commands]\nsoftware_retries = 11\n").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_options_conversion() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_options().stream_queue, 64);
        assert_eq!(
            config.channel_options().late_reply_grace,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.session_options().command_timeout,
            Duration::from_millis(1000)
        );
    }
}
