use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::config::GenesisConfig;
use super::crypto::sha256_hex;
use super::transaction::Transaction;

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Represents a block in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// Version of the block structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Index of the block in the chain
    pub index: u64,

    /// Timestamp when the block was created
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Transactions confirmed by this block
    pub transactions: Vec<Transaction>,

    /// Energy aggregated from the nodes for this block
    pub consolidated_energy: f64,

    /// Number of nodes whose energy was accepted
    pub node_count: u64,

    /// Value minted by this block
    pub reward: f64,

    /// Hash of the current block (calculated)
    pub hash: String,
}

/// Default version for blocks
fn default_version() -> u32 {
    1
}

impl Block {
    /// Creates a new block and computes its hash
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        previous_hash: String,
        consolidated_energy: f64,
        node_count: u64,
        reward: f64,
    ) -> Self {
        let mut block = Block {
            version: default_version(),
            index,
            timestamp: Utc::now(),
            previous_hash,
            transactions,
            consolidated_energy,
            node_count,
            reward,
            hash: String::new(),
        };

        block.hash = block.calculate_hash();
        block
    }

    /// Creates the genesis block holding the seed transaction
    pub fn genesis(config: &GenesisConfig) -> Self {
        let seed = Transaction::new_genesis(
            config.address.clone(),
            config.amount,
            config.public_key.clone(),
        );

        Block::new(
            0,
            vec![seed],
            GENESIS_PREVIOUS_HASH.to_string(),
            0.0,
            0,
            config.amount,
        )
    }

    /// Calculates the hash of the block
    ///
    /// Covers every field except `hash`, encoded as JSON with sorted keys.
    pub fn calculate_hash(&self) -> String {
        let block_data = serde_json::json!({
            "version": self.version,
            "index": self.index,
            "timestamp": self.timestamp,
            "previous_hash": self.previous_hash,
            "transactions": self.transactions,
            "consolidated_energy": self.consolidated_energy,
            "node_count": self.node_count,
            "reward": self.reward,
        });

        sha256_hex(block_data.to_string().as_bytes())
    }

    /// Checks that the stored hash matches the block's content
    pub fn has_valid_hash(&self) -> bool {
        self.hash == self.calculate_hash()
    }

    /// Ids of the transfers confirmed by this block
    pub fn transfer_ids(&self) -> Vec<String> {
        self.transactions
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .map(|tx| tx.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::Address;

    fn sample_block() -> Block {
        let transactions = vec![
            Transaction::new_reward(Address("recipient1".to_string()), 10.0, 1),
            Transaction::new_reward(Address("recipient2".to_string()), 20.0, 1),
        ];

        Block::new(1, transactions, "previous_hash".to_string(), 40_000.0, 3, 2.0)
    }

    #[test]
    fn test_new_block() {
        let block = sample_block();

        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.node_count, 3);
        assert_eq!(block.hash.len(), 64);
        assert!(block.has_valid_hash());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let block = sample_block();
        assert_eq!(block.calculate_hash(), block.calculate_hash());
        assert_eq!(block.clone().calculate_hash(), block.hash);
    }

    #[test]
    fn test_hash_survives_serialization() {
        let block = sample_block();

        let json = serde_json::to_string(&block).unwrap();
        let from_json: Block = serde_json::from_str(&json).unwrap();
        assert!(from_json.has_valid_hash());

        let bytes = bincode::serialize(&block).unwrap();
        let from_bincode: Block = bincode::deserialize(&bytes).unwrap();
        assert_eq!(from_bincode, block);
        assert!(from_bincode.has_valid_hash());
    }

    #[test]
    fn test_any_mutation_changes_hash() {
        let block = sample_block();

        let mutations: Vec<Box<dyn Fn(&mut Block)>> = vec![
            Box::new(|b| b.version += 1),
            Box::new(|b| b.index += 1),
            Box::new(|b| b.timestamp = b.timestamp + chrono::Duration::seconds(1)),
            Box::new(|b| b.previous_hash.push('0')),
            Box::new(|b| {
                b.transactions.pop();
            }),
            Box::new(|b| b.transactions[0].outputs[0].amount += 1.0),
            Box::new(|b| b.consolidated_energy += 1.0),
            Box::new(|b| b.node_count += 1),
            Box::new(|b| b.reward += 0.5),
        ];

        for mutate in mutations {
            let mut changed = block.clone();
            mutate(&mut changed);
            assert!(!changed.has_valid_hash());
        }
    }

    #[test]
    fn test_genesis_block() {
        let config = GenesisConfig {
            address: Address("genesis".to_string()),
            public_key: String::new(),
            amount: 1000.0,
        };
        let genesis = Block::genesis(&config);

        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
        assert_eq!(genesis.transactions.len(), 1);
        assert_eq!(genesis.transactions[0].outputs[0].amount, 1000.0);
        assert_eq!(genesis.reward, 1000.0);
        assert!(genesis.transfer_ids().is_empty());
        assert!(genesis.has_valid_hash());

        // The seed transaction is fixed by the configuration
        assert_eq!(Block::genesis(&config).transactions, genesis.transactions);
    }
}
