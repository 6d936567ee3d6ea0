use log::{debug, info};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::{BTreeMap, BTreeSet};

use super::block::Block;
use super::crypto::{parse_public_key, Address};
use super::storage::{LedgerStorage, StorageError};
use super::transaction::{OutputRef, Transaction};

/// Errors raised by the UTXO index
///
/// These indicate a broken ordering of spends and adds, never a user error.
#[derive(Debug, Error)]
pub enum UtxoError {
    #[error("Output {0} already exists")]
    DuplicateOutput(OutputRef),

    #[error("Output {0} is unknown or already spent")]
    UnknownOrAlreadySpent(OutputRef),

    #[error("Output {0} has a negative amount")]
    NegativeAmount(OutputRef),
}

/// An unspent transaction output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UtxoRecord {
    pub txid: String,
    pub index: u32,
    pub address: Address,
    pub amount: f64,
    /// Public key authorizing the spend, empty when only the address is known
    pub public_key: String,
}

impl UtxoRecord {
    pub fn output_ref(&self) -> OutputRef {
        OutputRef::new(self.txid.clone(), self.index)
    }

    /// Checks whether `key` may spend this output
    ///
    /// A recorded public key must match exactly; without one the key has
    /// to derive the owning address.
    pub fn is_spendable_by(&self, key: &PublicKey) -> bool {
        if self.public_key.is_empty() {
            return Address::from_public_key(key) == self.address;
        }

        match parse_public_key(&self.public_key) {
            Ok(recorded) => recorded == *key,
            Err(_) => false,
        }
    }
}

/// Read access to a set of unspent outputs
pub trait UtxoView {
    fn get_utxo(&self, output: &OutputRef) -> Option<&UtxoRecord>;
}

/// The confirmed unspent outputs, derived from the chain
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtxoIndex {
    utxos: BTreeMap<OutputRef, UtxoRecord>,
}

impl UtxoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a new unspent record
    pub fn add(&mut self, output: OutputRef, record: UtxoRecord) -> Result<(), UtxoError> {
        if record.amount < 0.0 {
            return Err(UtxoError::NegativeAmount(output));
        }
        if self.utxos.contains_key(&output) {
            return Err(UtxoError::DuplicateOutput(output));
        }

        self.utxos.insert(output, record);
        Ok(())
    }

    /// Removes an unspent record
    pub fn spend(&mut self, output: &OutputRef) -> Result<UtxoRecord, UtxoError> {
        self.utxos
            .remove(output)
            .ok_or_else(|| UtxoError::UnknownOrAlreadySpent(output.clone()))
    }

    pub fn get(&self, output: &OutputRef) -> Option<&UtxoRecord> {
        self.utxos.get(output)
    }

    /// Sum of the amounts of all live records owned by `address`
    pub fn balance_of(&self, address: &Address) -> f64 {
        self.records()
            .filter(|record| &record.address == address)
            .map(|record| record.amount)
            .sum()
    }

    /// All live records owned by `address`, in output reference order
    pub fn utxos_of(&self, address: &Address) -> Vec<UtxoRecord> {
        self.records()
            .filter(|record| &record.address == address)
            .cloned()
            .collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &UtxoRecord> {
        self.utxos.values()
    }

    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// Total value held by all live records
    pub fn total_supply(&self) -> f64 {
        self.records().map(|record| record.amount).sum()
    }

    /// Spends every input of `transaction`, then adds every output
    ///
    /// Not atomic: on error the index is left half-applied, so callers
    /// apply to a copy they can discard.
    pub fn apply_transaction(&mut self, transaction: &Transaction) -> Result<(), UtxoError> {
        for input in &transaction.inputs {
            self.spend(&input.output_ref())?;
        }
        for record in transaction.created_records() {
            self.add(record.output_ref(), record)?;
        }
        Ok(())
    }

    /// Rebuilds the index by replaying every block in order
    pub fn rebuild(blocks: &[Block]) -> Result<Self, UtxoError> {
        let mut index = UtxoIndex::new();
        for block in blocks {
            for transaction in &block.transactions {
                index.apply_transaction(transaction)?;
            }
        }

        info!(
            "UTXO index rebuilt from {} blocks: {} unspent outputs",
            blocks.len(),
            index.len()
        );
        Ok(index)
    }

    /// Writes a snapshot of the index, replacing the previous one
    pub fn persist(&self, storage: &LedgerStorage) -> Result<(), StorageError> {
        storage.replace_utxos(self.records())?;
        debug!("Persisted {} unspent outputs", self.len());
        Ok(())
    }

    /// Loads the last persisted snapshot
    pub fn reload(storage: &LedgerStorage) -> Result<Self, StorageError> {
        let utxos = storage
            .get_all_utxos()?
            .into_iter()
            .map(|record| (record.output_ref(), record))
            .collect();

        Ok(UtxoIndex { utxos })
    }
}

impl UtxoView for UtxoIndex {
    fn get_utxo(&self, output: &OutputRef) -> Option<&UtxoRecord> {
        self.get(output)
    }
}

/// Provisional effects of unconfirmed transactions on top of an index
#[derive(Debug, Clone, Default)]
pub struct UtxoOverlay {
    spent: BTreeSet<OutputRef>,
    created: BTreeMap<OutputRef, UtxoRecord>,
}

impl UtxoOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the inputs of `transaction` spent and its outputs created
    pub fn apply(&mut self, transaction: &Transaction) {
        for input in &transaction.inputs {
            self.spent.insert(input.output_ref());
        }
        for record in transaction.created_records() {
            self.created.insert(record.output_ref(), record);
        }
    }

    /// Drops the effects of `transaction`, once confirmed or rolled back
    ///
    /// Outputs it created that a later pending transaction spends stay
    /// hidden, since that spend remains recorded.
    pub fn forget(&mut self, transaction: &Transaction) {
        for input in &transaction.inputs {
            self.spent.remove(&input.output_ref());
        }
        for output in transaction.output_refs() {
            self.created.remove(&output);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spent.is_empty() && self.created.is_empty()
    }

    pub fn view<'a>(&'a self, base: &'a UtxoIndex) -> OverlayView<'a> {
        OverlayView {
            base,
            overlay: self,
        }
    }
}

/// An index seen through an overlay of pending effects
#[derive(Debug, Clone, Copy)]
pub struct OverlayView<'a> {
    base: &'a UtxoIndex,
    overlay: &'a UtxoOverlay,
}

impl<'a> OverlayView<'a> {
    fn records(&self) -> impl Iterator<Item = &'a UtxoRecord> + '_ {
        self.base
            .records()
            .chain(self.overlay.created.values())
            .filter(|record| !self.overlay.spent.contains(&record.output_ref()))
    }

    pub fn balance_of(&self, address: &Address) -> f64 {
        self.records()
            .filter(|record| &record.address == address)
            .map(|record| record.amount)
            .sum()
    }

    pub fn utxos_of(&self, address: &Address) -> Vec<UtxoRecord> {
        let mut records: Vec<UtxoRecord> = self
            .records()
            .filter(|record| &record.address == address)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.output_ref().cmp(&b.output_ref()));
        records
    }
}

impl UtxoView for OverlayView<'_> {
    fn get_utxo(&self, output: &OutputRef) -> Option<&UtxoRecord> {
        if self.overlay.spent.contains(output) {
            return None;
        }
        self.overlay
            .created
            .get(output)
            .or_else(|| self.base.get(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;
    use crate::blockchain::transaction::{TxInput, TxOutput};

    fn record(txid: &str, index: u32, address: &str, amount: f64) -> UtxoRecord {
        UtxoRecord {
            txid: txid.to_string(),
            index,
            address: Address(address.to_string()),
            amount,
            public_key: String::new(),
        }
    }

    #[test]
    fn test_add_and_get() {
        let mut index = UtxoIndex::new();
        let utxo = record("tx1", 0, "alice", 10.0);

        index.add(utxo.output_ref(), utxo.clone()).unwrap();

        assert_eq!(index.get(&OutputRef::new("tx1", 0)), Some(&utxo));
        assert_eq!(index.get(&OutputRef::new("tx1", 1)), None);
    }

    #[test]
    fn test_duplicate_output() {
        let mut index = UtxoIndex::new();
        let utxo = record("tx1", 0, "alice", 10.0);

        index.add(utxo.output_ref(), utxo.clone()).unwrap();
        let result = index.add(utxo.output_ref(), utxo);

        assert!(matches!(result, Err(UtxoError::DuplicateOutput(_))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut index = UtxoIndex::new();
        let utxo = record("tx1", 0, "alice", -1.0);

        assert!(matches!(
            index.add(utxo.output_ref(), utxo),
            Err(UtxoError::NegativeAmount(_))
        ));
    }

    #[test]
    fn test_spend_once() {
        let mut index = UtxoIndex::new();
        let utxo = record("tx1", 0, "alice", 10.0);
        index.add(utxo.output_ref(), utxo.clone()).unwrap();

        assert_eq!(index.spend(&utxo.output_ref()).unwrap(), utxo);
        assert!(matches!(
            index.spend(&utxo.output_ref()),
            Err(UtxoError::UnknownOrAlreadySpent(_))
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn test_balance_and_enumeration() {
        let mut index = UtxoIndex::new();
        for utxo in [
            record("tx2", 0, "alice", 5.0),
            record("tx1", 1, "bob", 7.0),
            record("tx1", 0, "alice", 10.0),
        ] {
            index.add(utxo.output_ref(), utxo).unwrap();
        }

        let alice = Address("alice".to_string());
        assert_eq!(index.balance_of(&alice), 15.0);
        assert_eq!(index.balance_of(&Address("carol".to_string())), 0.0);

        let owned: Vec<OutputRef> = index.utxos_of(&alice).iter().map(UtxoRecord::output_ref).collect();
        assert_eq!(owned, vec![OutputRef::new("tx1", 0), OutputRef::new("tx2", 0)]);
        assert_eq!(index.total_supply(), 22.0);
    }

    #[test]
    fn test_apply_transaction_spends_then_adds() {
        let wallet = Wallet::new().unwrap();
        let seed = Transaction::new_genesis(wallet.address().clone(), 10.0, wallet.public_key_hex());
        let mut index = UtxoIndex::new();
        index.apply_transaction(&seed).unwrap();

        let spend = Transaction::new(
            vec![TxInput::new(OutputRef::new(seed.id.clone(), 0), wallet.public_key_hex())],
            vec![
                TxOutput::new(Address("bob".to_string()), 4.0, ""),
                TxOutput::new(wallet.address().clone(), 6.0, wallet.public_key_hex()),
            ],
            0.0,
        );
        index.apply_transaction(&spend).unwrap();

        assert!(index.get(&OutputRef::new(seed.id.clone(), 0)).is_none());
        assert_eq!(index.balance_of(wallet.address()), 6.0);
        assert_eq!(index.balance_of(&Address("bob".to_string())), 4.0);

        assert!(matches!(
            index.apply_transaction(&spend),
            Err(UtxoError::UnknownOrAlreadySpent(_))
        ));
    }

    #[test]
    fn test_spend_authorization() {
        let owner = Wallet::new().unwrap();
        let other = Wallet::new().unwrap();

        let by_key = UtxoRecord {
            public_key: owner.public_key_hex(),
            ..record("tx", 0, "anything", 1.0)
        };
        assert!(by_key.is_spendable_by(owner.public_key()));
        assert!(!by_key.is_spendable_by(other.public_key()));

        let by_address = record("tx", 1, &owner.address().0, 1.0);
        assert!(by_address.is_spendable_by(owner.public_key()));
        assert!(!by_address.is_spendable_by(other.public_key()));
    }

    #[test]
    fn test_overlay_view() {
        let mut index = UtxoIndex::new();
        let base = record("tx1", 0, "alice", 10.0);
        index.add(base.output_ref(), base.clone()).unwrap();

        let spend = Transaction::new(
            vec![TxInput::new(base.output_ref(), "")],
            vec![TxOutput::new(Address("bob".to_string()), 10.0, "")],
            0.0,
        );

        let mut overlay = UtxoOverlay::new();
        overlay.apply(&spend);
        let view = overlay.view(&index);

        assert!(view.get_utxo(&base.output_ref()).is_none());
        assert_eq!(view.get_utxo(&OutputRef::new(spend.id.clone(), 0)).unwrap().amount, 10.0);
        assert_eq!(view.balance_of(&Address("alice".to_string())), 0.0);
        assert_eq!(view.balance_of(&Address("bob".to_string())), 10.0);
        assert_eq!(index.balance_of(&Address("alice".to_string())), 10.0);

        overlay.forget(&spend);
        assert!(overlay.is_empty());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LedgerStorage::new(dir.path()).unwrap();

        let mut index = UtxoIndex::new();
        for utxo in [record("tx1", 0, "alice", 10.0), record("tx1", 1, "bob", 2.5)] {
            index.add(utxo.output_ref(), utxo).unwrap();
        }
        index.persist(&storage).unwrap();
        assert_eq!(UtxoIndex::reload(&storage).unwrap(), index);

        index.spend(&OutputRef::new("tx1", 0)).unwrap();
        index.persist(&storage).unwrap();

        let reloaded = UtxoIndex::reload(&storage).unwrap();
        assert_eq!(reloaded, index);
        assert_eq!(reloaded.len(), 1);
    }
}
