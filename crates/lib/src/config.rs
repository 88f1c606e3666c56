//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.serialnet/config.json`) and environment.
//! Every field has a default, so a missing file is a valid configuration.

use crate::client::ClientOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Settings for `list` / `monitor` and other client uses.
    #[serde(default)]
    pub client: ClientConfig,

    /// Real serial port driver settings.
    #[serde(default)]
    pub serial: SerialConfig,

    /// When non-empty, the gateway serves these simulated loopback devices instead of real ports.
    #[serde(default)]
    pub simulated: Vec<String>,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Gateway WebSocket URL. Overridden by SERIALNET_URL env.
    #[serde(default = "default_client_url")]
    pub url: String,

    /// Give up on a request after this many milliseconds. Absent means wait forever.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_client_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_client_url(),
            request_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// How long one blocking read waits before re-checking for close (default 100).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_read_timeout_ms() -> u64 {
    100
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Resolve the gateway URL: env SERIALNET_URL overrides config.
pub fn resolve_client_url(config: &Config) -> String {
    std::env::var("SERIALNET_URL")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.client.url.trim().to_string())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SERIALNET_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".serialnet").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, or the default path (or SERIALNET_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 8080);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn empty_file_means_defaults() {
        let config: Config = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.client.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.client.request_timeout_ms, None);
        assert_eq!(config.serial.read_timeout_ms, 100);
        assert!(config.simulated.is_empty());
    }

    #[test]
    fn camel_case_keys() {
        let config: Config = serde_json::from_str(
            r#"{"gateway":{"port":9000},"client":{"requestTimeoutMs":2500},"serial":{"readTimeoutMs":20},"simulated":["sim0"]}"#,
        )
        .expect("parse");
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(
            config.client.options().request_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.serial.read_timeout_ms, 20);
        assert_eq!(config.simulated, vec!["sim0".to_string()]);
    }

    #[test]
    fn no_timeout_by_default() {
        assert_eq!(ClientConfig::default().options().request_timeout, None);
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("serialnet-missing-config-does-not-exist.json");
        let (config, used) = load_config(Some(path.clone())).expect("load");
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 8080);
    }
}
