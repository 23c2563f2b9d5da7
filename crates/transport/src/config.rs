//! Configuration types for connections and endpoints

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Per-connection timing, flow control and queue limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Force-close a connection that is not open after this long (default: 15000ms)
    pub new_connection_timeout_ms: u64,

    /// Interval between pings once open (default: 2000ms)
    pub ping_interval_ms: u64,

    /// Unanswered pings tolerated before the connection is declared dead (default: 5)
    pub max_ping_pong_attempts: u32,

    /// Delay before retrying a failed send (default: 500ms)
    pub flush_retry_timeout_ms: u64,

    /// Buffered bytes at which sending pauses (default: 2^17)
    pub buffer_threshold_high: usize,

    /// Buffered bytes below which sending resumes (default: 2^15)
    pub buffer_threshold_low: usize,

    /// Largest single message accepted (default: 1 MiB)
    pub max_message_size: usize,

    /// Queued messages per connection before the oldest is evicted (default: 5000)
    pub max_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            new_connection_timeout_ms: 15_000,
            ping_interval_ms: 2_000,
            max_ping_pong_attempts: 5,
            flush_retry_timeout_ms: 500,
            buffer_threshold_high: 1 << 17,
            buffer_threshold_low: 1 << 15,
            max_message_size: 1_048_576,
            max_queue_size: 5_000,
        }
    }
}

impl ConnectionConfig {
    /// Preset with short timers for LAN deployments and tests
    pub fn low_latency() -> Self {
        Self {
            new_connection_timeout_ms: 5_000,
            ping_interval_ms: 1_000,
            max_ping_pong_attempts: 3,
            flush_retry_timeout_ms: 100,
            ..Default::default()
        }
    }

    pub fn new_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.new_connection_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn flush_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_retry_timeout_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if a timer is zero or the buffer
    /// watermarks are not strictly ordered.
    pub fn validate(&self) -> Result<()> {
        if self.new_connection_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "new_connection_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.ping_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "ping_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.max_ping_pong_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_ping_pong_attempts must be greater than 0".to_string(),
            ));
        }

        if self.flush_retry_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "flush_retry_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.buffer_threshold_low >= self.buffer_threshold_high {
            return Err(Error::InvalidConfig(format!(
                "buffer_threshold_low ({}) must be below buffer_threshold_high ({})",
                self.buffer_threshold_low, self.buffer_threshold_high
            )));
        }

        if self.max_message_size == 0 || self.max_queue_size == 0 {
            return Err(Error::InvalidConfig(
                "max_message_size and max_queue_size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Configuration for a [`WebRtcEndpoint`](crate::rtc::WebRtcEndpoint)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcEndpointConfig {
    /// STUN server URLs
    pub stun_urls: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    pub connection: ConnectionConfig,
}

impl Default for WebRtcEndpointConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl WebRtcEndpointConfig {
    pub fn validate(&self) -> Result<()> {
        for url in &self.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN URL must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        self.connection.validate()
    }
}

/// Configuration for a [`WsEndpoint`](crate::ws::WsEndpoint)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsEndpointConfig {
    /// Interface to listen on
    pub host: String,

    /// Port to listen on (0 picks a free port)
    pub port: u16,

    /// Address peers use to reach us. Derived as `ws://host:port` when
    /// absent. Both sides compare these strings for the duplicate socket
    /// tie-break, so they must be canonical.
    pub advertised_address: Option<String>,

    pub connection: ConnectionConfig,
}

impl Default for WsEndpointConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 30300,
            advertised_address: None,
            connection: ConnectionConfig::default(),
        }
    }
}

impl WsEndpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::InvalidConfig("host must not be empty".to_string()));
        }

        if let Some(address) = &self.advertised_address {
            let parsed = url::Url::parse(address).map_err(|e| {
                Error::InvalidConfig(format!("advertised_address {} is invalid: {}", address, e))
            })?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(Error::InvalidConfig(format!(
                    "advertised_address must use ws:// or wss://, got {}",
                    address
                )));
            }
        }

        self.connection.validate()
    }
}

/// Top-level configuration file layout for the demo node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ws: WsEndpointConfig,
    pub webrtc: WebRtcEndpointConfig,
}

impl NodeConfig {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.ws.validate()?;
        self.webrtc.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ConnectionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_threshold_high, 131_072);
        assert_eq!(config.buffer_threshold_low, 32_768);
        assert_eq!(config.ping_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let config = ConnectionConfig {
            buffer_threshold_low: 10,
            buffer_threshold_high: 10,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_config_error());
    }

    #[test]
    fn test_low_latency_preset() {
        let config = ConnectionConfig::low_latency();
        assert!(config.validate().is_ok());
        assert!(config.new_connection_timeout_ms < ConnectionConfig::default().new_connection_timeout_ms);
    }

    #[test]
    fn test_invalid_stun_url() {
        let config = WebRtcEndpointConfig {
            stun_urls: vec!["http://example.com".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_advertised_address() {
        let config = WsEndpointConfig {
            advertised_address: Some("http://127.0.0.1:1".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_override() {
        let config = NodeConfig::from_toml_str(
            r#"
            [ws]
            port = 4000

            [ws.connection]
            ping_interval_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.ws.port, 4000);
        assert_eq!(config.ws.connection.ping_interval_ms, 250);
        assert_eq!(config.ws.connection.max_ping_pong_attempts, 5);
        assert_eq!(config.webrtc, WebRtcEndpointConfig::default());
    }

    #[test]
    fn test_toml_invalid_values() {
        let err = NodeConfig::from_toml_str("[ws.connection]\nping_interval_ms = 0\n").unwrap_err();
        assert!(err.is_config_error());

        let err = NodeConfig::from_toml_str("[ws\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
