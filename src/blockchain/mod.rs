// Ledger module
//
// This module contains the energy-backed UTXO ledger including:
// - Block and transaction structures
// - Per-address transaction history
// - The UTXO index and the admission pool
// - Proof of energy and the node registry
// - Cryptography utilities
// - Durable storage

pub mod block;
pub mod chain;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod history;
pub mod mempool;
pub mod nodes;
pub mod storage;
pub mod transaction;
pub mod utxo;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError};
pub use config::LedgerConfig;
pub use consensus::ProofOfEnergy;
pub use crypto::Address;
pub use history::HistoryEntry;
pub use nodes::{DailyData, EnergyReading, NodeRecord, NodeRegistry};
pub use storage::LedgerStorage;
pub use transaction::{OutputRef, Transaction, TxInput, TxOutput};
pub use utxo::UtxoRecord;
