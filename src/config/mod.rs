//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP/3 connection tuning
    pub connection: ConnectionConfig,
    /// In-process transport used by the loopback tool
    pub memory: MemoryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Per-connection limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Capacity of the queue of incoming streams with non-reserved types
    pub incoming_stream_queue: usize,
    /// Maximum number of incoming unidirectional streams classified at once
    pub max_uni_stream_handlers: usize,
    /// Announce HTTP datagram support in the default SETTINGS.
    /// When unset, mirrors what the transport negotiated.
    pub enable_datagrams: Option<bool>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            incoming_stream_queue: 1,
            max_uni_stream_handlers: 64,
            enable_datagrams: None,
        }
    }
}

/// In-process transport parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Whether the pair reports datagram support
    pub datagrams: bool,
    /// Bidirectional streams each side may have open towards the other
    pub max_bidi_streams: usize,
    /// Per-stream pipe buffer in bytes
    pub stream_buffer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            datagrams: true,
            max_bidi_streams: 100,
            stream_buffer: 64 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        connection: ConnectionConfig {
            enable_datagrams: Some(true),
            ..ConnectionConfig::default()
        },
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            incoming_stream_queue = 8

            [memory]
            datagrams = false
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.incoming_stream_queue, 8);
        assert_eq!(config.connection.max_uni_stream_handlers, 64);
        assert_eq!(config.connection.enable_datagrams, None);
        assert!(!config.memory.datagrams);
        assert_eq!(config.memory.max_bidi_streams, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("h3conn-config-{}.toml", std::process::id()));
        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/h3conn.toml").unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
    }
}
