use std::path::Path;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RelayError, Result};

/// Top-level configuration for the Relay client.
///
/// Loaded from `~/.relay/config.toml` by default. Every section falls back to
/// its defaults, so a partial file (or none at all) is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transport.endpoint.trim().is_empty() {
            return Err(RelayError::Config("transport.endpoint is empty".into()));
        }
        if self.transport.heartbeat_ms == 0 {
            return Err(RelayError::Config("transport.heartbeat_ms must be > 0".into()));
        }
        if self.transport.heartbeat_grace < 1.0 {
            return Err(RelayError::Config(
                "transport.heartbeat_grace must be >= 1.0".into(),
            ));
        }
        if self.sync.server_utc_offset_minutes.abs() >= 24 * 60 {
            return Err(RelayError::Config(
                "sync.server_utc_offset_minutes must be within one day".into(),
            ));
        }
        if self.sync.event_capacity == 0 {
            return Err(RelayError::Config("sync.event_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Publish/subscribe transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket endpoint of the STOMP broker.
    pub endpoint: String,
    /// Value of the STOMP `host` header.
    pub host: String,
    /// Outgoing heart-beat interval; also the basis of the liveness timeout.
    pub heartbeat_ms: u64,
    /// The link is declared dead after `heartbeat_ms * heartbeat_grace` of
    /// inbound silence.
    pub heartbeat_grace: f64,
    /// Delay before each automatic reconnect attempt.
    pub reconnect_delay_ms: u64,
    /// Upper bound on opening the link plus the STOMP handshake.
    pub connect_timeout_ms: u64,
    /// Session cookie forwarded on the WebSocket upgrade request.
    pub session_cookie: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8080/ws/websocket".to_string(),
            host: "localhost".to_string(),
            heartbeat_ms: 10_000,
            heartbeat_grace: 2.0,
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 10_000,
            session_cookie: None,
        }
    }
}

impl TransportConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    /// Inbound silence tolerated before the link is considered dead, given
    /// the send interval the broker advertised in `CONNECTED`.
    ///
    /// The broker actually beats every `max(advertised, heartbeat_ms)`.
    /// `None` when it advertised no heart-beats: silence is then normal.
    pub fn liveness_timeout(&self, broker_sends_ms: u64) -> Option<Duration> {
        if broker_sends_ms == 0 || self.heartbeat_ms == 0 {
            return None;
        }
        let interval = Duration::from_millis(broker_sends_ms.max(self.heartbeat_ms));
        Some(interval.mul_f64(self.heartbeat_grace.max(1.0)))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Reconciliation and send settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// A USER fragment matching a local message within this window is an echo.
    pub echo_window_ms: i64,
    /// Longest message the server accepts.
    pub max_message_chars: usize,
    /// Capacity of the sync event broadcast channel.
    pub event_capacity: usize,
    /// UTC offset of the server clock, for the zone-less times it sends.
    pub server_utc_offset_minutes: i32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            echo_window_ms: 5_000,
            max_message_chars: 5_000,
            event_capacity: 256,
            server_utc_offset_minutes: 0,
        }
    }
}

impl SyncConfig {
    /// The server's clock offset; out-of-range values fall back to UTC.
    pub fn server_offset(&self) -> FixedOffset {
        self.server_utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix())
    }
}

/// History/CRUD collaborator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Base URL of the request/response API.
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl HistoryConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.transport.endpoint, "ws://localhost:8080/ws/websocket");
        assert_eq!(config.transport.heartbeat(), Duration::from_secs(10));
        assert_eq!(
            config.transport.liveness_timeout(10_000),
            Some(Duration::from_secs(20))
        );
        assert_eq!(config.transport.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.sync.echo_window_ms, 5_000);
        assert_eq!(config.sync.max_message_chars, 5_000);
        assert!(config.transport.session_cookie.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_liveness_follows_negotiated_interval() {
        let transport = TransportConfig {
            heartbeat_ms: 20,
            heartbeat_grace: 2.0,
            ..TransportConfig::default()
        };
        // A slower broker sets the pace.
        assert_eq!(
            transport.liveness_timeout(60),
            Some(Duration::from_millis(120))
        );
        // A faster one is still only owed our own interval.
        assert_eq!(
            transport.liveness_timeout(5),
            Some(Duration::from_millis(40))
        );
        assert_eq!(transport.liveness_timeout(0), None);
    }

    #[test]
    fn test_server_offset() {
        let mut config = RelayConfig::default();
        assert_eq!(config.sync.server_offset().local_minus_utc(), 0);

        config.sync.server_utc_offset_minutes = 540;
        assert_eq!(config.sync.server_offset().local_minus_utc(), 540 * 60);
        assert!(config.validate().is_ok());

        config.sync.server_utc_offset_minutes = -24 * 60;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
        assert_eq!(config.sync.server_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[transport]
endpoint = "ws://chat.example.com/ws"
heartbeat_ms = 4000
"#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.transport.endpoint, "ws://chat.example.com/ws");
        assert_eq!(config.transport.heartbeat_ms, 4000);
        assert_eq!(config.transport.reconnect_delay_ms, 5_000);
        assert_eq!(config.sync.echo_window_ms, 5_000);
        assert_eq!(config.history.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RelayConfig::default();
        config.transport.session_cookie = Some("JSESSIONID=abc".to_string());
        config.sync.echo_window_ms = 2_500;
        config.save(&path).unwrap();

        let loaded = RelayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = RelayConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "transport = [[[").unwrap();
        let config = RelayConfig::load_or_default(&path);
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.transport.heartbeat_ms = 0;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));

        let mut config = RelayConfig::default();
        config.transport.heartbeat_grace = 0.5;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.transport.endpoint = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nevent_capacity = 0\n").unwrap();
        assert!(matches!(RelayConfig::load(&path), Err(RelayError::Config(_))));
    }
}
