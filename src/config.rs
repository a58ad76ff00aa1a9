/**
 * config.rs
 *
 * Typed configuration loaded from config.yaml in the working directory.
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Tunnel mode: which side of the session this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,
    pub id: String,
    pub peer: String,
    pub port: u16,
    pub stun_server: SocketAddr,
    pub signaling_url: String,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `config.yaml` in the current working directory.
    pub fn load_default() -> Result<Self> {
        Self::load_from(Path::new("config.yaml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.display()))?;
        Self::parse(&raw)
    }

    fn parse(raw: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(raw).context("failed to parse config.yaml")?;
        if config.id == config.peer {
            anyhow::bail!("id and peer must not be the same node identifier");
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_client_config() {
        let yaml = r#"
mode: client
id: alice
peer: bob
port: 7777
stun_server: "127.0.0.1:3478"
signaling_url: "wss://example.com:8443"
"#;
        let cfg = Config::parse(yaml).unwrap();
        assert_eq!(cfg.mode, Mode::Client);
        assert_eq!(cfg.id, "alice");
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn rejects_self_referential_peer() {
        let yaml = r#"
mode: server
id: alice
peer: alice
port: 7777
stun_server: "127.0.0.1:3478"
signaling_url: "wss://example.com:8443"
"#;
        assert!(Config::parse(yaml).is_err());
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(Config::parse("not: [valid").is_err());
    }
}
