use std::path::Path;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use bincode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::nodes::NodeRecord;
use super::transaction::Transaction;
use super::utxo::UtxoRecord;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Durable storage for the ledger
///
/// One sled tree per collection. Keys are chosen so that sled's
/// lexicographic order is the logical order of each collection.
pub struct LedgerStorage {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian height
    blocks: Tree,

    /// Unspent outputs keyed by output reference
    utxos: Tree,

    /// Pending transactions keyed by big-endian admission position
    mempool: Tree,

    /// Registered energy nodes keyed by node id
    nodes: Tree,

    /// Makes `save_block` fail, to exercise commit recovery
    #[cfg(test)]
    fail_block_writes: AtomicBool,
}

impl std::fmt::Debug for LedgerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStorage").finish()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T, StorageError> {
    bincode::deserialize(bytes)
        .map_err(|e| StorageError::DeserializationError(format!("{}: {}", what, e)))
}

fn utxo_key(record: &UtxoRecord) -> Vec<u8> {
    let mut key = Vec::with_capacity(record.txid.len() + 5);
    key.extend_from_slice(record.txid.as_bytes());
    key.push(0);
    key.extend_from_slice(&record.index.to_be_bytes());
    key
}

impl LedgerStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let utxos = db.open_tree("utxos")?;
        let mempool = db.open_tree("mempool")?;
        let nodes = db.open_tree("nodes")?;

        Ok(Self {
            db,
            blocks,
            utxos,
            mempool,
            nodes,
            #[cfg(test)]
            fail_block_writes: AtomicBool::new(false),
        })
    }

    /// Saves a block and flushes it to disk
    pub fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        #[cfg(test)]
        if self.fail_block_writes.load(Ordering::SeqCst) {
            return Err(sled::Error::Unsupported(format!("block {} write refused", block.index)).into());
        }

        let value = encode(block)?;
        self.blocks.insert(block.index.to_be_bytes(), value)?;
        self.flush()
    }

    #[cfg(test)]
    pub fn fail_block_writes(&self, fail: bool) {
        self.fail_block_writes.store(fail, Ordering::SeqCst);
    }

    /// Gets all blocks in height order
    ///
    /// The chain is authoritative, so a block that cannot be decoded is an error.
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        for entry in self.blocks.iter() {
            let (key, value) = entry?;
            let what = format!("block {}", hex::encode(&key));
            blocks.push(decode::<Block>(&value, &what)?);
        }
        Ok(blocks)
    }

    /// Replaces the persisted UTXO snapshot in one atomic batch
    pub fn replace_utxos<'a, I>(&self, records: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = &'a UtxoRecord>,
    {
        let mut entries = Vec::new();
        for record in records {
            entries.push((utxo_key(record), encode(record)?));
        }
        self.replace_tree(&self.utxos, entries)
    }

    pub fn get_all_utxos(&self) -> Result<Vec<UtxoRecord>, StorageError> {
        Self::read_tree(&self.utxos, "utxo")
    }

    /// Replaces the persisted mempool, keeping admission order
    pub fn replace_mempool(&self, transactions: &[Transaction]) -> Result<(), StorageError> {
        let mut entries = Vec::new();
        for (position, transaction) in transactions.iter().enumerate() {
            entries.push(((position as u64).to_be_bytes().to_vec(), encode(transaction)?));
        }
        self.replace_tree(&self.mempool, entries)
    }

    pub fn get_all_mempool(&self) -> Result<Vec<Transaction>, StorageError> {
        Self::read_tree(&self.mempool, "mempool transaction")
    }

    /// Saves a registered node and flushes it to disk
    pub fn save_node(&self, node: &NodeRecord) -> Result<(), StorageError> {
        self.nodes.insert(node.node_id.as_bytes(), encode(node)?)?;
        self.flush()
    }

    pub fn get_all_nodes(&self) -> Result<Vec<NodeRecord>, StorageError> {
        Self::read_tree(&self.nodes, "node")
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn replace_tree(&self, tree: &Tree, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for key in tree.iter().keys() {
            batch.remove(key?);
        }
        for (key, value) in entries {
            batch.insert(key, value);
        }

        tree.apply_batch(batch)?;
        self.flush()
    }

    fn read_tree<T: DeserializeOwned>(tree: &Tree, what: &str) -> Result<Vec<T>, StorageError> {
        let mut items = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            items.push(decode(&value, what)?);
        }
        Ok(items)
    }
}
