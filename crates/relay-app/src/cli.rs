//! CLI argument definitions for the Relay client.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::Parser;
use relay_core::config::RelayConfig;
use std::path::PathBuf;

/// Relay: a terminal client for streamed chat conversations.
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// WebSocket endpoint of the message broker.
    #[arg(short = 'e', long = "endpoint")]
    pub endpoint: Option<String>,

    /// Base URL of the conversation history API.
    #[arg(short = 'a', long = "api")]
    pub api: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Conversation to open on start.
    #[arg(long = "conversation")]
    pub conversation: Option<String>,

    /// Run against an in-process broker with a local echo assistant.
    #[arg(long = "offline")]
    pub offline: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > RELAY_CONFIG env var > ~/.relay/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("RELAY_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Priority: --endpoint flag > RELAY_ENDPOINT env var > config file value.
    pub fn resolve_endpoint(&self, configured: &str) -> String {
        if let Some(ref endpoint) = self.endpoint {
            return endpoint.clone();
        }
        std::env::var("RELAY_ENDPOINT").unwrap_or_else(|_| configured.to_string())
    }

    /// Priority: --api flag > RELAY_API env var > config file value.
    pub fn resolve_api(&self, configured: &str) -> String {
        if let Some(ref api) = self.api {
            return api.clone();
        }
        std::env::var("RELAY_API").unwrap_or_else(|_| configured.to_string())
    }

    /// Returns `None` if not overridden.
    pub fn resolve_log_level(&self) -> Option<String> {
        self.log_level.clone()
    }

    /// Fold every override into the loaded configuration.
    pub fn apply(&self, config: &mut RelayConfig) {
        config.transport.endpoint = self.resolve_endpoint(&config.transport.endpoint);
        config.history.base_url = self.resolve_api(&config.history.base_url);
        if let Some(level) = self.resolve_log_level() {
            config.general.log_level = level;
        }
    }
}

fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".relay").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".relay").join("config.toml");
    }
    PathBuf::from("config.toml")
}
