use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

use crate::blockchain::LedgerConfig;

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Energy-backed UTXO ledger node")]
pub struct Cli {
    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Directory of the ledger database
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Keep all state in memory; nothing survives a restart
    #[arg(long, conflicts_with = "data_dir")]
    pub in_memory: bool,

    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds between automatic mining cycles; 0 disables them
    #[arg(long)]
    pub mining_interval: Option<u64>,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Seconds between automatic mining cycles
    pub mining_interval_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            mining_interval_secs: None,
        }
    }
}

/// Complete node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    /// Reads a JSON configuration file; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Builds the configuration from the command line
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(cli);
        Ok(config)
    }

    fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(data_dir) = &cli.data_dir {
            self.ledger.data_dir = Some(data_dir.clone());
        }
        if cli.in_memory {
            self.ledger.data_dir = None;
        }
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(interval) = cli.mining_interval {
            self.server.mining_interval_secs = (interval > 0).then_some(interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.ledger.data_dir, Some(PathBuf::from("data/ledger")));
        assert_eq!(config.server.mining_interval_secs, None);
    }

    #[test]
    fn test_file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "server": {{ "port": 9000, "mining_interval_secs": 60 }}, "ledger": {{ "mempool_capacity": 7 }} }}"#
        )
        .unwrap();

        let cli = Cli::parse_from([
            "energy_ledger",
            "--config",
            file.path().to_str().unwrap(),
            "--host",
            "0.0.0.0",
            "--mining-interval",
            "0",
        ]);
        let config = AppConfig::load(&cli).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.mining_interval_secs, None);
        assert_eq!(config.ledger.mempool_capacity, 7);
        assert_eq!(config.ledger.max_block_transactions, 100);
        assert_eq!(config.ledger.data_dir, Some(PathBuf::from("data/ledger")));
    }

    #[test]
    fn test_in_memory_flag() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "ledger": {{ "data_dir": "/var/lib/ledger" }} }}"#).unwrap();

        let cli = Cli::parse_from(["energy_ledger", "--config", file.path().to_str().unwrap()]);
        assert_eq!(
            AppConfig::load(&cli).unwrap().ledger.data_dir,
            Some(PathBuf::from("/var/lib/ledger"))
        );

        let cli = Cli::parse_from([
            "energy_ledger",
            "--config",
            file.path().to_str().unwrap(),
            "--in-memory",
        ]);
        assert_eq!(AppConfig::load(&cli).unwrap().ledger.data_dir, None);

        assert!(Cli::try_parse_from(["energy_ledger", "--in-memory", "--data-dir", "x"]).is_err());
    }

    #[test]
    fn test_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let cli = Cli::parse_from(["energy_ledger", "--config", file.path().to_str().unwrap()]);
        assert!(matches!(AppConfig::load(&cli), Err(ConfigError::Parse { .. })));
    }
}
