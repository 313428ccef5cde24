//! Configuration management: `caravela.toml` with built-in defaults.

use crate::error::{NodeError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub miner: MinerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port; 0 lets the OS pick one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Addresses dialed at startup to enter the overlay, as `host:port`.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Seconds between sync-heartbeat rounds.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinerConfig {
    /// Wallet credited by coinbase rewards; defaults to the node's
    /// `host:port` when unset.
    #[serde(default)]
    pub wallet: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: default_host(),
            port: default_port(),
            bootstrap_peers: Vec::new(),
            sync_interval_secs: default_sync_interval(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_sync_interval() -> u64 {
    30
}

/// Load `caravela.toml` from the working directory, falling back to the
/// built-in defaults when the file is absent.
pub fn load_config() -> Result<Config> {
    load_config_from("caravela.toml")
}

pub fn load_config_from(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| NodeError::Config(format!("failed to read {}: {}", path.display(), err)))?;
    let config: Config = toml::from_str(&raw)
        .map_err(|err| NodeError::Config(format!("failed to parse {}: {}", path.display(), err)))?;

    if config.network.host.is_empty() {
        return Err(NodeError::Config("network.host must not be empty".into()));
    }
    if config.network.sync_interval_secs == 0 {
        return Err(NodeError::Config(
            "network.sync_interval_secs must be positive".into(),
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_file_absent() {
        let dir = TempDir::new().unwrap();
        let config = load_config_from(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.port, 5000);
        assert!(config.network.bootstrap_peers.is_empty());
        assert_eq!(config.network.sync_interval_secs, 30);
        assert!(config.miner.wallet.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("caravela.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[network]
host = "0.0.0.0"
port = 5001
bootstrap_peers = ["10.0.0.1:5000", "10.0.0.2:5000"]
sync_interval_secs = 10

[miner]
wallet = "andrey"
"#
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.network.host, "0.0.0.0");
        assert_eq!(config.network.port, 5001);
        assert_eq!(config.network.bootstrap_peers.len(), 2);
        assert_eq!(config.network.sync_interval_secs, 10);
        assert_eq!(config.miner.wallet.as_deref(), Some("andrey"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("caravela.toml");
        std::fs::write(&path, "[network]\nport = 9000\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.network.port, 9000);
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.network.sync_interval_secs, 30);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("caravela.toml");
        std::fs::write(&path, "[network]\nsync_interval_secs = 0\n").unwrap();
        assert!(load_config_from(&path).is_err());

        std::fs::write(&path, "not toml at all [[[").unwrap();
        assert!(load_config_from(&path).is_err());
    }
}
