use serde::{Deserialize, Serialize};

use std::path::PathBuf;

use super::consensus::DEFAULT_ENERGY_TOLERANCE;
use super::crypto::Address;
use super::mempool::DEFAULT_CAPACITY;

/// Directory of the sled database unless configured otherwise
pub const DEFAULT_DATA_DIR: &str = "data/ledger";

/// Address funded by the default genesis block
pub const DEFAULT_GENESIS_ADDRESS: &str = "71721447aa64ea52835cb918e79dc2d6c919e921";

/// Compressed public key controlling the default genesis output
pub const DEFAULT_GENESIS_PUBLIC_KEY: &str =
    "038f231d59aa2419510f26929b9668d2093d4ceacfe0559a0ab2c654b2faab27a8";

/// Initial balance granted by the default genesis block
pub const DEFAULT_GENESIS_AMOUNT: f64 = 1000.0;

/// Default number of transactions a block may confirm
pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 100;

/// The seed transaction of the genesis block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub address: Address,
    pub public_key: String,
    pub amount: f64,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        GenesisConfig {
            address: Address(DEFAULT_GENESIS_ADDRESS.to_string()),
            public_key: DEFAULT_GENESIS_PUBLIC_KEY.to_string(),
            amount: DEFAULT_GENESIS_AMOUNT,
        }
    }
}

/// Configuration of the ledger engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Directory of the sled database; `null` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    /// Maximum number of pending transactions
    pub mempool_capacity: usize,

    /// Maximum number of pool transactions confirmed per block
    pub max_block_transactions: usize,

    /// Relative tolerance for energy cross-checks
    pub energy_tolerance: f64,

    pub genesis: GenesisConfig,

    /// Recipient of minted rewards and collected fees; the genesis address when absent
    pub reward_address: Option<Address>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            data_dir: Some(PathBuf::from(DEFAULT_DATA_DIR)),
            mempool_capacity: DEFAULT_CAPACITY,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
            energy_tolerance: DEFAULT_ENERGY_TOLERANCE,
            genesis: GenesisConfig::default(),
            reward_address: None,
        }
    }
}

impl LedgerConfig {
    /// Address credited with block rewards
    pub fn reward_address(&self) -> &Address {
        self.reward_address.as_ref().unwrap_or(&self.genesis.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: LedgerConfig =
            serde_json::from_str(r#"{ "mempool_capacity": 5, "reward_address": "abc" }"#).unwrap();

        assert_eq!(config.mempool_capacity, 5);
        assert_eq!(config.data_dir, Some(PathBuf::from(DEFAULT_DATA_DIR)));
        assert_eq!(config.max_block_transactions, DEFAULT_MAX_BLOCK_TRANSACTIONS);
        assert_eq!(config.genesis, GenesisConfig::default());
        assert_eq!(config.reward_address(), &Address("abc".to_string()));
    }

    #[test]
    fn test_null_data_dir_means_memory() {
        let config: LedgerConfig = serde_json::from_str(r#"{ "data_dir": null }"#).unwrap();
        assert_eq!(config.data_dir, None);
    }

    #[test]
    fn test_default_genesis_address_matches_key() {
        let derived = Address::from_public_key_hex(DEFAULT_GENESIS_PUBLIC_KEY).unwrap();
        assert_eq!(derived.0, DEFAULT_GENESIS_ADDRESS);
    }

    #[test]
    fn test_reward_address_falls_back_to_genesis() {
        let config = LedgerConfig::default();
        assert_eq!(config.reward_address().0, DEFAULT_GENESIS_ADDRESS);
    }
}
