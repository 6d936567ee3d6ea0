//! Per-address transaction history over the chain and the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use std::collections::HashMap;

use super::block::Block;
use super::crypto::Address;
use super::transaction::{OutputRef, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Confirmed,
    Pending,
}

/// One movement of value to or from an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryEntry {
    pub txid: String,
    pub direction: Direction,
    pub status: EntryStatus,

    /// Net value that left the address, or value it received
    pub amount: f64,

    /// Height of the confirming block, absent while pending
    pub block_index: Option<u64>,

    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,
}

/// Lists what `address` sent and received, newest first
///
/// A transaction spending an output of `address` counts as sent, for the
/// spent value minus the change paid back. Any other transaction paying
/// `address` counts as received. Pending transactions are stamped with
/// their admission time, confirmed ones with their block's.
pub fn history_of(chain: &[Block], pending: &[Transaction], address: &Address) -> Vec<HistoryEntry> {
    let mut owners: HashMap<OutputRef, (Address, f64)> = HashMap::new();
    let mut entries = Vec::new();

    let confirmed = chain.iter().flat_map(|block| {
        block
            .transactions
            .iter()
            .map(move |tx| (tx, EntryStatus::Confirmed, Some(block.index), block.timestamp))
    });
    let pooled = pending
        .iter()
        .map(|tx| (tx, EntryStatus::Pending, None, tx.timestamp.unwrap_or_else(Utc::now)));

    for (transaction, status, block_index, timestamp) in confirmed.chain(pooled) {
        let spent: f64 = transaction
            .inputs
            .iter()
            .filter_map(|input| owners.get(&input.output_ref()))
            .filter(|(owner, _)| owner == address)
            .map(|(_, amount)| amount)
            .sum();
        let paid_back: f64 = transaction
            .outputs
            .iter()
            .filter(|output| &output.address == address)
            .map(|output| output.amount)
            .sum();

        for record in transaction.created_records() {
            owners.insert(record.output_ref(), (record.address, record.amount));
        }

        let (direction, amount) = if spent > 0.0 {
            (Direction::Sent, spent - paid_back)
        } else {
            (Direction::Received, paid_back)
        };

        if amount > 0.0 {
            entries.push(HistoryEntry {
                txid: transaction.id.clone(),
                direction,
                status,
                amount,
                block_index,
                timestamp,
            });
        }
    }

    // Newest first; equal timestamps keep the later transaction in front
    entries.reverse();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{TxInput, TxOutput};

    fn address(name: &str) -> Address {
        Address(name.to_string())
    }

    #[test]
    fn test_sent_excludes_change_and_received_sums_outputs() {
        let genesis = Block::new(
            0,
            vec![Transaction::new_genesis(address("alice"), 100.0, "")],
            "0".repeat(64),
            0.0,
            0,
            100.0,
        );
        let source = OutputRef::new(genesis.transactions[0].id.clone(), 0);

        let spend = Transaction::new(
            vec![TxInput::new(source, "")],
            vec![
                TxOutput::new(address("bob"), 30.0, ""),
                TxOutput::new(address("alice"), 69.0, ""),
            ],
            1.0,
        );
        let block = Block::new(1, vec![spend.clone()], genesis.hash.clone(), 0.0, 0, 0.0);
        let chain = vec![genesis, block];

        let alice = history_of(&chain, &[], &address("alice"));
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].txid, spend.id);
        assert_eq!(alice[0].direction, Direction::Sent);
        assert_eq!(alice[0].amount, 31.0);
        assert_eq!(alice[0].block_index, Some(1));
        assert_eq!(alice[1].direction, Direction::Received);
        assert_eq!(alice[1].amount, 100.0);

        let bob = history_of(&chain, &[], &address("bob"));
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].direction, Direction::Received);
        assert_eq!(bob[0].amount, 30.0);

        assert!(history_of(&chain, &[], &address("carol")).is_empty());
    }
}
