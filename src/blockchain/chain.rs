use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::block::{Block, GENESIS_PREVIOUS_HASH};
use super::config::LedgerConfig;
use super::consensus::ProofOfEnergy;
use super::crypto::Address;
use super::history::{self, HistoryEntry};
use super::mempool::{Mempool, MempoolError};
use super::nodes::{DailyData, NodeError, NodeRegistry};
use super::storage::{LedgerStorage, StorageError};
use super::transaction::{OutputRef, Transaction, TransactionError};
use super::utxo::{UtxoError, UtxoIndex, UtxoOverlay, UtxoRecord};

/// Node id under which the daily aggregate is checked by consensus
pub const DAILY_AGGREGATE_NODE: &str = "daily_aggregate";

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(TransactionError),

    #[error("Mempool is full ({capacity} transactions)")]
    PoolFull { capacity: usize },

    #[error("Consensus rejected the reported energy {energy}")]
    ConsensusRejected { energy: f64 },

    #[error("Persistence failure: {0}")]
    PersistenceFailure(#[from] StorageError),

    #[error("Invalid chain: {0}")]
    InvalidChain(String),

    #[error("UTXO error: {0}")]
    UtxoError(#[from] UtxoError),

    #[error("Node error: {0}")]
    NodeError(#[from] NodeError),
}

impl From<MempoolError> for BlockchainError {
    fn from(err: MempoolError) -> Self {
        match err {
            MempoolError::InvalidTransaction(err) => BlockchainError::InvalidTransaction(err),
            MempoolError::PoolFull { capacity } => BlockchainError::PoolFull { capacity },
            MempoolError::StorageError(err) => BlockchainError::PersistenceFailure(err),
        }
    }
}

/// The ledger: chain of blocks, confirmed UTXO index and admission pool
///
/// Locks are always taken in the order pool, index, chain.
#[derive(Debug)]
pub struct Blockchain {
    /// The chain of blocks
    chain: RwLock<Vec<Block>>,

    /// Unspent outputs of the confirmed chain
    utxos: RwLock<UtxoIndex>,

    /// Transactions waiting for a block
    mempool: Mutex<Mempool>,

    consensus: Arc<ProofOfEnergy>,

    config: LedgerConfig,

    /// Storage for ledger data
    storage: Option<Arc<LedgerStorage>>,
}

impl Blockchain {
    /// Creates an in-memory ledger holding only the genesis block
    pub fn new(config: LedgerConfig) -> Result<Self, BlockchainError> {
        let consensus = Arc::new(ProofOfEnergy::new(config.energy_tolerance));
        Self::open(config, consensus, None)
    }

    /// Opens a ledger, loading its state from `storage` when given
    ///
    /// # Arguments
    ///
    /// * `config` - Ledger configuration
    /// * `consensus` - Reward and consensus rules
    /// * `storage` - Backing store; the genesis block is created there when empty
    ///
    /// # Returns
    ///
    /// The ledger, with its UTXO index rebuilt from the chain and the
    /// persisted pool re-admitted against it
    pub fn open(
        config: LedgerConfig,
        consensus: Arc<ProofOfEnergy>,
        storage: Option<Arc<LedgerStorage>>,
    ) -> Result<Self, BlockchainError> {
        let mut chain = match &storage {
            Some(storage) => storage.get_all_blocks()?,
            None => Vec::new(),
        };

        if chain.is_empty() {
            let genesis = Block::genesis(&config.genesis);
            if let Some(storage) = &storage {
                storage.save_block(&genesis)?;
            }
            info!("Created genesis block {}", genesis.hash);
            chain.push(genesis);
        } else {
            info!("Loaded {} blocks from storage", chain.len());
        }

        check_chain(&chain).map_err(BlockchainError::InvalidChain)?;

        let utxos =
            UtxoIndex::rebuild(&chain).map_err(|err| BlockchainError::InvalidChain(err.to_string()))?;

        let mempool = match &storage {
            Some(storage) => {
                utxos.persist(storage)?;
                Mempool::with_storage(config.mempool_capacity, storage.clone(), &utxos)?
            }
            None => Mempool::new(config.mempool_capacity),
        };

        Ok(Blockchain {
            chain: RwLock::new(chain),
            utxos: RwLock::new(utxos),
            mempool: Mutex::new(mempool),
            consensus,
            config,
            storage,
        })
    }

    /// Submits a signed transfer to the admission pool
    ///
    /// # Returns
    ///
    /// The id of the admitted transaction
    pub fn submit(&self, transaction: Transaction) -> Result<String, BlockchainError> {
        let mut mempool = lock(&self.mempool);
        let utxos = read(&self.utxos);
        Ok(mempool.submit(transaction, &utxos)?)
    }

    /// Produces the next block from one day of node data
    ///
    /// Candidates are the day's proposed transactions followed by the pool's
    /// best transactions; each is checked against the ones accepted before
    /// it. The block mints `mint(total_energy)` and pays it, together with
    /// the collected fees, to the configured reward address.
    ///
    /// # Arguments
    ///
    /// * `daily` - Energy and candidate transactions for this cycle
    ///
    /// # Returns
    ///
    /// The appended block, or `None` when there was nothing to confirm and no energy to reward
    pub fn mine(&self, daily: DailyData) -> Result<Option<Block>, BlockchainError> {
        let DailyData {
            total_energy,
            valid_node_count,
            candidate_transactions,
        } = daily;

        let mut mempool = lock(&self.mempool);
        let mut utxos = write(&self.utxos);
        let mut chain = write(&self.chain);

        let pooled = mempool.select_for_block(self.config.max_block_transactions);
        let (mut transactions, fees) = assemble(candidate_transactions.into_iter().chain(pooled), &utxos);

        if transactions.is_empty() && total_energy == 0.0 {
            debug!("Nothing to mine");
            return Ok(None);
        }

        if !self.consensus.validate(DAILY_AGGREGATE_NODE, total_energy) {
            return Err(BlockchainError::ConsensusRejected {
                energy: total_energy,
            });
        }

        let tip = chain
            .last()
            .ok_or_else(|| BlockchainError::InvalidChain("chain is empty".to_string()))?;
        let index = tip.index + 1;

        let reward = self.consensus.mint(total_energy);
        let payout = reward + fees;
        if payout > 0.0 {
            transactions.push(Transaction::new_reward(
                self.config.reward_address().clone(),
                payout,
                index,
            ));
        }

        let block = Block::new(
            index,
            transactions,
            tip.hash.clone(),
            total_energy,
            valid_node_count,
            reward,
        );

        let mut next = utxos.clone();
        for transaction in &block.transactions {
            next.apply_transaction(transaction)?;
        }
        self.persist_commit(&next, &utxos, &block)?;

        *utxos = next;
        chain.push(block.clone());

        if let Err(err) = mempool.confirm(&block.transfer_ids()) {
            warn!("Failed to persist the pool after block {}: {}", block.index, err);
        }
        if let Err(err) = mempool.revalidate(&utxos) {
            warn!("Failed to persist the revalidated pool: {}", err);
        }

        info!(
            "Mined block {} with {} transactions, reward {} for {} Wh",
            block.index,
            block.transactions.len(),
            block.reward,
            block.consolidated_energy
        );
        Ok(Some(block))
    }

    /// Aggregates the registry's last day of energy and mines it
    ///
    /// The nodes' readings are consumed only when a block is appended; a
    /// rejected or failed cycle leaves them for the next attempt.
    pub fn mine_from_registry(&self, registry: &NodeRegistry) -> Result<Option<Block>, BlockchainError> {
        let _cycle = registry.begin_cycle();
        let snapshot = registry.snapshot_daily(Utc::now());

        let mined = self.mine(snapshot.daily.clone())?;
        if mined.is_some() {
            if let Err(err) = registry.settle(&snapshot) {
                error!("Block mined but node readings were not saved as settled: {}", err);
            }
        }
        Ok(mined)
    }

    /// Writes the new index, then the block
    ///
    /// The block is the last durable write. If it fails the previous index
    /// snapshot is written back; replaying the chain at startup recovers
    /// from a failed restore.
    fn persist_commit(&self, next: &UtxoIndex, previous: &UtxoIndex, block: &Block) -> Result<(), BlockchainError> {
        let storage = match &self.storage {
            Some(storage) => storage,
            None => return Ok(()),
        };

        if let Err(err) = next.persist(storage) {
            error!("Failed to persist the UTXO index for block {}: {}", block.index, err);
            return Err(err.into());
        }

        if let Err(err) = storage.save_block(block) {
            error!("Failed to persist block {}: {}", block.index, err);
            if let Err(restore) = previous.persist(storage) {
                error!("Failed to restore the previous UTXO index: {}", restore);
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Gets the entire chain
    pub fn get_chain(&self) -> Vec<Block> {
        read(&self.chain).clone()
    }

    pub fn get_last_block(&self) -> Option<Block> {
        read(&self.chain).last().cloned()
    }

    pub fn height(&self) -> u64 {
        read(&self.chain).last().map(|block| block.index).unwrap_or_default()
    }

    /// Pending transactions in admission order
    pub fn get_pending_transactions(&self) -> Vec<Transaction> {
        lock(&self.mempool).all()
    }

    /// Balance of `address` including the effects of pending transactions
    pub fn balance_of(&self, address: &Address) -> f64 {
        let mempool = lock(&self.mempool);
        let utxos = read(&self.utxos);
        mempool.balance_of(&utxos, address)
    }

    /// Outputs spendable by `address` once pending transactions are confirmed
    pub fn utxos_of(&self, address: &Address) -> Vec<UtxoRecord> {
        let mempool = lock(&self.mempool);
        let utxos = read(&self.utxos);
        mempool.utxos_of(&utxos, address)
    }

    pub fn confirmed_balance_of(&self, address: &Address) -> f64 {
        read(&self.utxos).balance_of(address)
    }

    pub fn confirmed_utxos_of(&self, address: &Address) -> Vec<UtxoRecord> {
        read(&self.utxos).utxos_of(address)
    }

    /// Confirmed and pending transactions of `address`, newest first
    pub fn history_of(&self, address: &Address) -> Vec<HistoryEntry> {
        let mempool = lock(&self.mempool);
        let chain = read(&self.chain);
        history::history_of(&chain, &mempool.all(), address)
    }

    pub fn get_utxo(&self, output: &OutputRef) -> Option<UtxoRecord> {
        read(&self.utxos).get(output).cloned()
    }

    /// Copy of the confirmed UTXO index
    pub fn utxo_snapshot(&self) -> UtxoIndex {
        read(&self.utxos).clone()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Validates the chain
    ///
    /// # Returns
    ///
    /// true if every hash matches its block and every block links to its predecessor
    pub fn is_valid(&self) -> bool {
        match check_chain(&read(&self.chain)) {
            Ok(()) => true,
            Err(reason) => {
                warn!("Chain audit failed: {}", reason);
                false
            }
        }
    }
}

/// Re-validates candidates in order against the confirmed index
///
/// Returns the accepted transactions and the fees they leave for the block.
fn assemble<I>(candidates: I, index: &UtxoIndex) -> (Vec<Transaction>, f64)
where
    I: IntoIterator<Item = Transaction>,
{
    let mut batch = UtxoOverlay::new();
    let mut seen = HashSet::new();
    let mut accepted = Vec::new();
    let mut fees = 0.0;

    for transaction in candidates {
        if !seen.insert(transaction.id.clone()) {
            continue;
        }

        match transaction.validate(&batch.view(index)) {
            Ok(summary) => {
                batch.apply(&transaction);
                fees += summary.collected_fee();
                accepted.push(transaction);
            }
            Err(err) => warn!("Leaving transaction {} out of the block: {}", transaction.id, err),
        }
    }

    (accepted, fees)
}

/// Checks genesis, hashes and linkage of a chain
fn check_chain(chain: &[Block]) -> Result<(), String> {
    let genesis = chain.first().ok_or_else(|| "chain is empty".to_string())?;
    if genesis.index != 0 || genesis.previous_hash != GENESIS_PREVIOUS_HASH {
        return Err("first block is not a genesis block".to_string());
    }

    for (position, block) in chain.iter().enumerate() {
        if !block.has_valid_hash() {
            return Err(format!("block {} has an invalid hash", block.index));
        }

        if position == 0 {
            continue;
        }

        let previous = &chain[position - 1];
        if block.index != previous.index + 1 {
            return Err(format!("block {} follows block {}", block.index, previous.index));
        }
        if block.previous_hash != previous.hash {
            return Err(format!("block {} does not link to block {}", block.index, previous.index));
        }
    }

    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
