//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COURIER_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use courier_core::SessionPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session configuration.
    #[serde(default)]
    pub session: SessionConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// What happens when an already-online user joins again:
    /// `multi-device`, `replace`, or `reject`.
    #[serde(default)]
    pub policy: SessionPolicy,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum direct-message content length in characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Recommended client heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Deadline for the hello handshake in milliseconds.
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("COURIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("COURIER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(4000)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_content_length() -> usize {
    4096
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_hello_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            session: SessionConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            hello_timeout_ms: default_hello_timeout(),
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
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "courier.toml",
            "/etc/courier/courier.toml",
            "~/.config/courier/courier.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 4000);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.session.policy, SessionPolicy::Replace);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [session]
            policy = "multi-device"

            [limits]
            max_content_length = 1024
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.session.policy, SessionPolicy::MultiDevice);
        assert_eq!(config.limits.max_content_length, 1024);
        // Unspecified sections fall back to defaults
        assert_eq!(config.limits.max_message_size, 64 * 1024);
    }

    #[test]
    fn test_session_policy_values() {
        for (text, policy) in [
            ("multi-device", SessionPolicy::MultiDevice),
            ("replace", SessionPolicy::Replace),
            ("reject", SessionPolicy::Reject),
        ] {
            let toml_str = format!("[session]\npolicy = \"{text}\"");
            let config: Config = toml::from_str(&toml_str).unwrap();
            assert_eq!(config.session.policy, policy);
        }
    }
}
