//! Agent configuration loaded from `DESKCTL_*` environment variables

use anyhow::{Context, Result};
use deskctl_shared::limits;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for every field of [`AgentConfig`]
pub const ENV_PREFIX: &str = "DESKCTL_";

/// Configuration for the agent
///
/// Each field maps to `DESKCTL_<FIELD>`, e.g. `DESKCTL_HTTP_ADDR` or
/// `DESKCTL_ALLOWED_COMMANDS=mute,lock`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "enabled")]
    pub http_enabled: bool,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    #[serde(default = "enabled")]
    pub grpc_enabled: bool,
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: String,

    #[serde(default)]
    pub mqtt_enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default = "default_mqtt_client_id")]
    pub mqtt_client_id: String,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    #[serde(default = "default_mqtt_base_topic")]
    pub mqtt_base_topic: String,

    /// Path of the versioned command catalog document
    #[serde(default = "default_commands_file")]
    pub commands_file: PathBuf,

    /// Shared PIN secret; absent or empty means PIN-protected commands always fail
    pub pin: Option<String>,
    #[serde(default)]
    pub whitelist_enabled: bool,
    #[serde(default)]
    pub allowed_commands: Vec<String>,

    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_cleanup_secs")]
    pub rate_limit_cleanup_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn enabled() -> bool {
    true
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_grpc_addr() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_client_id() -> String {
    "deskctl-agent".to_string()
}

fn default_mqtt_base_topic() -> String {
    "deskctl".to_string()
}

fn default_commands_file() -> PathBuf {
    PathBuf::from("commands.json")
}

fn default_rate_limit_max_requests() -> u32 {
    limits::RATE_LIMIT_MAX_REQUESTS
}

fn default_rate_limit_window_secs() -> u64 {
    limits::RATE_LIMIT_WINDOW_MS / 1000
}

fn default_rate_limit_cleanup_secs() -> u64 {
    limits::RATE_LIMIT_CLEANUP_INTERVAL_MS / 1000
}

fn default_timeout_ms() -> u64 {
    limits::DEFAULT_COMMAND_TIMEOUT_MS
}

fn default_shutdown_timeout_secs() -> u64 {
    limits::SHUTDOWN_TIMEOUT_MS / 1000
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            http_enabled: true,
            http_addr: default_http_addr(),
            grpc_enabled: true,
            grpc_addr: default_grpc_addr(),
            mqtt_enabled: false,
            mqtt_host: default_mqtt_host(),
            mqtt_port: default_mqtt_port(),
            mqtt_client_id: default_mqtt_client_id(),
            mqtt_username: None,
            mqtt_password: None,
            mqtt_base_topic: default_mqtt_base_topic(),
            commands_file: default_commands_file(),
            pin: None,
            whitelist_enabled: false,
            allowed_commands: Vec::new(),
            rate_limit_max_requests: default_rate_limit_max_requests(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            rate_limit_cleanup_secs: default_rate_limit_cleanup_secs(),
            default_timeout_ms: default_timeout_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `DESKCTL_*` environment variables
    pub fn from_env() -> Result<Self> {
        envy::prefixed(ENV_PREFIX)
            .from_env::<Self>()
            .context("failed to load config from DESKCTL_* env vars")
    }

    /// The configured PIN, treating an empty value as unset
    pub fn pin_secret(&self) -> Option<String> {
        self.pin.clone().filter(|p| !p.is_empty())
    }

    /// Allowed command ids with blanks dropped
    pub fn allowed_set(&self) -> HashSet<String> {
        self.allowed_commands
            .iter()
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn rate_limit_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cleanup_secs.max(1))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Number of listeners switched on
    pub fn enabled_listener_count(&self) -> usize {
        [self.http_enabled, self.grpc_enabled, self.mqtt_enabled]
            .iter()
            .filter(|&&on| on)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> AgentConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()));
        envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .expect("config should parse")
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]);
        assert!(config.http_enabled);
        assert!(config.grpc_enabled);
        assert!(!config.mqtt_enabled);
        assert_eq!(config.http_addr, "0.0.0.0:8080");
        assert_eq!(config.mqtt_base_topic, "deskctl");
        assert_eq!(config.rate_limit_max_requests, limits::RATE_LIMIT_MAX_REQUESTS);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(config.enabled_listener_count(), 2);
        assert!(config.pin_secret().is_none());
    }

    #[test]
    fn test_overrides_and_lists() {
        let config = from_pairs(&[
            ("MQTT_ENABLED", "true"),
            ("HTTP_ENABLED", "false"),
            ("PIN", "4321"),
            ("ALLOWED_COMMANDS", "mute, lock,"),
            ("RATE_LIMIT_WINDOW_SECS", "5"),
        ]);
        assert!(config.mqtt_enabled);
        assert!(!config.http_enabled);
        assert_eq!(config.pin_secret().as_deref(), Some("4321"));
        let allowed = config.allowed_set();
        assert_eq!(allowed.len(), 2);
        assert!(allowed.contains("lock"));
        assert_eq!(config.rate_limit_window(), Duration::from_secs(5));
    }

    #[test]
    fn test_empty_pin_is_unset() {
        let config = from_pairs(&[("PIN", "")]);
        assert!(config.pin_secret().is_none());
    }
}
