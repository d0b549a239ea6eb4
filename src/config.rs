//! Configuration for the node service
//!
//! Loaded from a JSON file. Only the controller and the ambient pieces
//! (metrics listener, certificate renewal) are configured here; inbound
//! and outbound state comes from the management API at runtime.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::api::NodeType;
use crate::cert::CertMode;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Remote management API endpoint.
    pub api: ApiConfig,

    /// Reconciliation interval in seconds.
    #[serde(default = "default_update_periodic")]
    pub update_periodic: u64,

    /// Address new inbounds listen on.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// Prometheus endpoint, e.g. "127.0.0.1:9090". Disabled when unset.
    #[serde(default)]
    pub metrics_listen: Option<String>,

    #[serde(default)]
    pub cert: CertConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub api_host: String,
    pub api_key: String,
    pub node_id: u32,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CertConfig {
    pub cert_mode: CertMode,
    pub cert_domain: String,
    pub email: String,
    pub provider: String,
    pub dns_env: HashMap<String, String>,
}

fn default_update_periodic() -> u64 {
    60
}

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_json(
            r#"{
                "api": {
                    "api_host": "https://panel.example.com",
                    "api_key": "secret",
                    "node_id": 7,
                    "node_type": "V2ray"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.update_periodic, 60);
        assert_eq!(config.listen_ip, "0.0.0.0");
        assert_eq!(config.api.node_id, 7);
        assert_eq!(config.api.node_type, NodeType::V2ray);
        assert_eq!(config.cert.cert_mode, CertMode::None);
        assert!(config.metrics_listen.is_none());
    }

    #[test]
    fn cert_and_metrics_sections_parse() {
        let config = Config::from_json(
            r#"{
                "api": {
                    "api_host": "https://panel.example.com",
                    "api_key": "secret",
                    "node_id": 7,
                    "node_type": "Trojan"
                },
                "update_periodic": 30,
                "metrics_listen": "127.0.0.1:9090",
                "cert": {
                    "cert_mode": "dns",
                    "cert_domain": "node.example.com",
                    "email": "ops@example.com",
                    "provider": "cloudflare",
                    "dns_env": {"CF_API_TOKEN": "tok"}
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.update_periodic, 30);
        assert_eq!(config.cert.cert_mode, CertMode::Dns);
        assert!(config.cert.cert_mode.needs_renewal());
        assert_eq!(config.cert.dns_env["CF_API_TOKEN"], "tok");
        assert_eq!(config.metrics_listen.as_deref(), Some("127.0.0.1:9090"));
    }
}
