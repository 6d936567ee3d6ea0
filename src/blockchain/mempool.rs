//! Admission pool of unconfirmed transactions.
//!
//! Transactions are validated against the confirmed UTXO index seen
//! through the pool's own overlay, so a pending transaction can spend the
//! outputs of another pending transaction but never an output that some
//! pending transaction already spends.

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use std::collections::HashSet;
use std::sync::Arc;

use super::crypto::Address;
use super::storage::{LedgerStorage, StorageError};
use super::transaction::{Transaction, TransactionError};
use super::utxo::{OverlayView, UtxoIndex, UtxoOverlay, UtxoRecord};

/// Default maximum number of pending transactions
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Errors that can occur when using the mempool
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Mempool is full ({capacity} transactions)")]
    PoolFull { capacity: usize },

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// Pending transactions in admission order plus their provisional effects
#[derive(Debug)]
pub struct Mempool {
    transactions: Vec<Transaction>,
    overlay: UtxoOverlay,
    capacity: usize,
    storage: Option<Arc<LedgerStorage>>,
}

impl Mempool {
    /// Creates an empty in-memory pool
    pub fn new(capacity: usize) -> Self {
        Mempool {
            transactions: Vec::new(),
            overlay: UtxoOverlay::new(),
            capacity,
            storage: None,
        }
    }

    /// Loads the persisted pool and re-admits it against `index`
    pub fn with_storage(
        capacity: usize,
        storage: Arc<LedgerStorage>,
        index: &UtxoIndex,
    ) -> Result<Self, MempoolError> {
        let transactions = storage.get_all_mempool()?;
        info!("Loaded {} pending transactions", transactions.len());

        let mut mempool = Mempool {
            transactions,
            overlay: UtxoOverlay::new(),
            capacity,
            storage: Some(storage),
        };
        mempool.revalidate(index)?;
        Ok(mempool)
    }

    /// Validates and admits a transaction
    ///
    /// On success the transaction's inputs are spent and its outputs created
    /// in the pool's view. On failure nothing changes.
    pub fn submit(&mut self, mut transaction: Transaction, index: &UtxoIndex) -> Result<String, MempoolError> {
        if self.transactions.len() >= self.capacity {
            return Err(MempoolError::PoolFull {
                capacity: self.capacity,
            });
        }

        transaction.validate(&self.overlay.view(index))?;

        if transaction.timestamp.is_none() {
            transaction.timestamp = Some(Utc::now());
        }

        self.overlay.apply(&transaction);
        self.transactions.push(transaction);

        if let Err(err) = self.persist() {
            if let Some(transaction) = self.transactions.pop() {
                self.overlay.forget(&transaction);
            }
            return Err(err.into());
        }

        let id = self
            .transactions
            .last()
            .map(|transaction| transaction.id.clone())
            .unwrap_or_default();
        info!("Transaction {} added to the mempool", id);
        Ok(id)
    }

    /// Up to `max_count` transactions, highest fee first, earliest first on ties
    pub fn select_for_block(&self, max_count: usize) -> Vec<Transaction> {
        let mut candidates = self.transactions.clone();
        candidates.sort_by(|a, b| b.fee.total_cmp(&a.fee).then_with(|| a.timestamp.cmp(&b.timestamp)));
        candidates.truncate(max_count);
        candidates
    }

    /// Removes transactions confirmed in a block; unknown ids are ignored
    pub fn confirm(&mut self, ids: &[String]) -> Result<(), MempoolError> {
        let ids: HashSet<&String> = ids.iter().collect();
        let before = self.transactions.len();

        let mut kept = Vec::with_capacity(before);
        for transaction in self.transactions.drain(..) {
            if ids.contains(&transaction.id) {
                self.overlay.forget(&transaction);
            } else {
                kept.push(transaction);
            }
        }
        self.transactions = kept;

        let removed = before - self.transactions.len();
        if removed > 0 {
            info!("Removed {} confirmed transactions from the mempool", removed);
            self.persist()?;
        }
        Ok(())
    }

    /// Rebuilds the pool's view against `index`, dropping what no longer validates
    ///
    /// Transactions are replayed in admission order. Returns the ids dropped.
    pub fn revalidate(&mut self, index: &UtxoIndex) -> Result<Vec<String>, MempoolError> {
        let mut overlay = UtxoOverlay::new();
        let mut kept = Vec::with_capacity(self.transactions.len());
        let mut dropped = Vec::new();

        for transaction in self.transactions.drain(..) {
            match transaction.validate(&overlay.view(index)) {
                Ok(_) => {
                    overlay.apply(&transaction);
                    kept.push(transaction);
                }
                Err(err) => {
                    warn!("Dropping pending transaction {}: {}", transaction.id, err);
                    dropped.push(transaction.id);
                }
            }
        }

        self.transactions = kept;
        self.overlay = overlay;

        if !dropped.is_empty() {
            self.persist()?;
        }
        debug!(
            "Mempool revalidated: {} kept, {} dropped",
            self.transactions.len(),
            dropped.len()
        );
        Ok(dropped)
    }

    /// Snapshot of the pending transactions in admission order
    pub fn all(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The confirmed index with pending effects applied
    pub fn view<'a>(&'a self, index: &'a UtxoIndex) -> OverlayView<'a> {
        self.overlay.view(index)
    }

    pub fn balance_of(&self, index: &UtxoIndex, address: &Address) -> f64 {
        self.view(index).balance_of(address)
    }

    pub fn utxos_of(&self, index: &UtxoIndex, address: &Address) -> Vec<UtxoRecord> {
        self.view(index).utxos_of(address)
    }

    fn persist(&self) -> Result<(), StorageError> {
        if let Some(storage) = &self.storage {
            storage.replace_mempool(&self.transactions)?;
        }
        Ok(())
    }
}
