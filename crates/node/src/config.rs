//! Node configuration: a JSON file plus a few command-line overrides.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use umbrad_consensus::{Checkpoints, Network};
use umbrad_crypto::hash_from_hex;
use umbrad_log::{Format, Level};

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(message) => write!(f, "config io: {message}"),
            ConfigError::Parse(message) => write!(f, "config parse: {message}"),
            ConfigError::Invalid(message) => write!(f, "config invalid: {message}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MiningSection {
    pub enabled: bool,
    pub threads: usize,
    pub stake_address: Option<String>,
    pub wallet_host: String,
    pub wallet_port: u16,
    pub extra_messages_file: Option<PathBuf>,
    pub print_hashrate: bool,
}

impl Default for MiningSection {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 1,
            stake_address: None,
            wallet_host: "127.0.0.1".to_string(),
            wallet_port: 8071,
            extra_messages_file: None,
            print_hashrate: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CheckpointItem {
    pub height: u32,
    pub hash: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub network: String,
    pub log_level: String,
    pub log_format: String,
    pub checkpoints: Vec<CheckpointItem>,
    pub mining: MiningSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./umbra-data"),
            network: "mainnet".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            checkpoints: Vec::new(),
            mining: MiningSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw =
            std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        serde_json::from_str(&raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn network(&self) -> Result<Network, ConfigError> {
        match self.network.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ConfigError::Invalid(format!("unknown network {other:?}"))),
        }
    }

    pub fn log_level(&self) -> Level {
        Level::parse(&self.log_level).unwrap_or(Level::Info)
    }

    pub fn log_format(&self) -> Format {
        Format::parse(&self.log_format).unwrap_or(Format::Text)
    }

    pub fn checkpoint_set(&self) -> Result<Checkpoints, ConfigError> {
        let mut checkpoints = Checkpoints::new();
        for item in &self.checkpoints {
            let hash = hash_from_hex(&item.hash).ok_or_else(|| {
                ConfigError::Invalid(format!("checkpoint at {} has a bad hash", item.height))
            })?;
            if !checkpoints.add_checkpoint(item.height, hash) {
                return Err(ConfigError::Invalid(format!(
                    "conflicting checkpoint at height {}",
                    item.height
                )));
            }
        }
        Ok(checkpoints)
    }

    pub fn blockchain_dir(&self) -> PathBuf {
        self.data_dir.join("blockchain")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.network().ok(), Some(Network::Mainnet));
        assert_eq!(config.log_level(), Level::Info);
        assert!(config.checkpoint_set().expect("checkpoints").is_empty());
    }

    #[test]
    fn parses_a_full_config() {
        let raw = r#"{
            "data_dir": "/var/lib/umbra",
            "network": "testnet",
            "log_level": "debug",
            "log_format": "json",
            "checkpoints": [
                {"height": 10, "hash": "aa00000000000000000000000000000000000000000000000000000000000bb1"}
            ],
            "mining": {"enabled": true, "threads": 4, "wallet_host": "10.0.0.2", "wallet_port": 9000}
        }"#;
        let config: Config = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.network().ok(), Some(Network::Testnet));
        assert_eq!(config.mining.threads, 4);
        let checkpoints = config.checkpoint_set().expect("checkpoints");
        assert!(checkpoints.is_in_checkpoint_zone(10));
        assert_eq!(config.blockchain_dir(), PathBuf::from("/var/lib/umbra/blockchain"));
    }

    #[test]
    fn rejects_bad_checkpoint_hash() {
        let mut config = Config::default();
        config.checkpoints.push(CheckpointItem {
            height: 5,
            hash: "not-hex".to_string(),
        });
        assert!(config.checkpoint_set().is_err());
    }
}
