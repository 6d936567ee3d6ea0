use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::BTreeSet;
use std::fmt;

use super::crypto::{parse_public_key, sha256_hex, verify_signature, Address, CryptoError, DigitalSignature, Wallet};
use super::utxo::{UtxoRecord, UtxoView};

/// Tolerance used when comparing sums of amounts
pub const AMOUNT_EPSILON: f64 = 1e-8;

/// Errors that can occur during transaction operations
///
/// Every variant is a reason for rejecting a transaction as invalid.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Transaction has no inputs")]
    NoInputs,

    #[error("Only transfer transactions can be submitted, got {0}")]
    NotTransfer(TransactionKind),

    #[error("Transaction id mismatch: expected {expected}, got {actual}")]
    IdMismatch { expected: String, actual: String },

    #[error("Input {0} is referenced more than once")]
    DuplicateInput(OutputRef),

    #[error("UTXO {0} not found or already spent")]
    UnknownInput(OutputRef),

    #[error("Public key of input {position} is not authorized to spend {output}")]
    UnauthorizedInput { position: usize, output: OutputRef },

    #[error("Input {position} is not signed")]
    NotSigned { position: usize },

    #[error("Invalid signature for input {position}")]
    InvalidSignature { position: usize },

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Wallet key does not match the public key of input {position}")]
    KeyMismatch { position: usize },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Reference to a single transaction output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct OutputRef {
    /// Id of the transaction that created the output
    pub txid: String,

    /// Position of the output in that transaction
    pub index: u32,
}

impl OutputRef {
    pub fn new(txid: impl Into<String>, index: u32) -> Self {
        OutputRef {
            txid: txid.into(),
            index,
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// What a transaction is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// A signed transfer spending existing outputs
    #[default]
    Transfer,

    /// The seed transaction of the genesis block
    Genesis,

    /// Value minted by a block (energy reward plus collected fees)
    Reward,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::Genesis => "genesis",
            TransactionKind::Reward => "reward",
        };
        write!(f, "{}", name)
    }
}

/// A transaction input spending one unspent output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TxInput {
    /// Id of the transaction holding the spent output
    pub txid: String,

    /// Position of the spent output
    pub index: u32,

    /// Hex encoded public key authorizing the spend
    pub public_key: String,

    /// Signature over `"{id}:{position}"`
    #[serde(default)]
    pub signature: Option<DigitalSignature>,
}

impl TxInput {
    pub fn new(output: OutputRef, public_key: impl Into<String>) -> Self {
        TxInput {
            txid: output.txid,
            index: output.index,
            public_key: public_key.into(),
            signature: None,
        }
    }

    pub fn output_ref(&self) -> OutputRef {
        OutputRef::new(self.txid.clone(), self.index)
    }
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TxOutput {
    /// Destination address
    pub address: Address,

    /// Amount transferred
    pub amount: f64,

    /// Public key (or locking descriptor) required from a future spender
    #[serde(default)]
    pub public_key: String,
}

impl TxOutput {
    pub fn new(address: Address, amount: f64, public_key: impl Into<String>) -> Self {
        TxOutput {
            address,
            amount,
            public_key: public_key.into(),
        }
    }
}

/// Input and output totals of a transaction that passed validation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransactionSummary {
    pub input_total: f64,
    pub output_total: f64,
}

impl TransactionSummary {
    /// Value left over by the transaction, collected by the block that confirms it
    pub fn collected_fee(&self) -> f64 {
        (self.input_total - self.output_total).max(0.0)
    }
}

/// Represents a transaction in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Transaction {
    /// Version of the transaction structure
    #[serde(default = "default_version")]
    pub version: u32,

    /// Content hash of the transaction
    pub id: String,

    #[serde(default)]
    pub kind: TransactionKind,

    pub inputs: Vec<TxInput>,

    pub outputs: Vec<TxOutput>,

    /// Transaction fee
    #[serde(default)]
    pub fee: f64,

    /// Height of the block minting a reward transaction
    #[serde(default)]
    pub block_index: Option<u64>,

    /// Admission timestamp, stamped by the mempool when absent
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "2023-01-01T12:00:00Z")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Default version for transactions
fn default_version() -> u32 {
    1
}

impl Transaction {
    /// Creates a new unsigned transfer
    ///
    /// The id is computed immediately, so input public keys must already be set.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, fee: f64) -> Self {
        Self::build(TransactionKind::Transfer, inputs, outputs, fee, None)
    }

    /// Creates the seed transaction of the genesis block
    pub fn new_genesis(address: Address, amount: f64, public_key: impl Into<String>) -> Self {
        let output = TxOutput::new(address, amount, public_key);
        Self::build(TransactionKind::Genesis, Vec::new(), vec![output], 0.0, None)
    }

    /// Creates the reward transaction minted by block `block_index`
    pub fn new_reward(recipient: Address, amount: f64, block_index: u64) -> Self {
        let output = TxOutput::new(recipient, amount, String::new());
        Self::build(TransactionKind::Reward, Vec::new(), vec![output], 0.0, Some(block_index))
    }

    fn build(
        kind: TransactionKind,
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        fee: f64,
        block_index: Option<u64>,
    ) -> Self {
        let mut transaction = Transaction {
            version: default_version(),
            id: String::new(),
            kind,
            inputs,
            outputs,
            fee,
            block_index,
            timestamp: None,
        };
        transaction.id = transaction.calculate_id();
        transaction
    }

    /// Calculates the content hash of the transaction
    ///
    /// Signatures and the admission timestamp are not covered, so neither
    /// signing nor admission changes the id.
    pub fn calculate_id(&self) -> String {
        let inputs: Vec<serde_json::Value> = self
            .inputs
            .iter()
            .map(|input| {
                serde_json::json!({
                    "txid": input.txid,
                    "index": input.index,
                    "public_key": input.public_key,
                })
            })
            .collect();

        let data = serde_json::json!({
            "version": self.version,
            "kind": self.kind,
            "inputs": inputs,
            "outputs": self.outputs,
            "fee": self.fee,
            "block_index": self.block_index,
        });

        sha256_hex(data.to_string().as_bytes())
    }

    /// Message signed for input `position`
    pub fn signing_message(&self, position: usize) -> String {
        format!("{}:{}", self.id, position)
    }

    /// Signs input `position` with a wallet
    pub fn sign_input(&mut self, position: usize, wallet: &Wallet) -> Result<(), TransactionError> {
        let message = self.signing_message(position);
        let input = self
            .inputs
            .get_mut(position)
            .ok_or(TransactionError::NotSigned { position })?;

        if parse_public_key(&input.public_key)? != *wallet.public_key() {
            return Err(TransactionError::KeyMismatch { position });
        }

        input.signature = Some(wallet.sign(message.as_bytes())?);
        Ok(())
    }

    /// Signs every input with the same wallet
    pub fn sign(&mut self, wallet: &Wallet) -> Result<(), TransactionError> {
        for position in 0..self.inputs.len() {
            self.sign_input(position, wallet)?;
        }
        Ok(())
    }

    /// Checks if the transaction mints value instead of spending it
    pub fn is_coinbase(&self) -> bool {
        self.kind != TransactionKind::Transfer
    }

    /// Sum of all output amounts
    pub fn total_output(&self) -> f64 {
        self.outputs.iter().map(|output| output.amount).sum()
    }

    /// References of the outputs this transaction creates
    pub fn output_refs(&self) -> impl Iterator<Item = OutputRef> + '_ {
        (0..self.outputs.len()).map(move |index| OutputRef::new(self.id.clone(), index as u32))
    }

    /// Records created by this transaction's outputs
    pub fn created_records(&self) -> impl Iterator<Item = UtxoRecord> + '_ {
        self.outputs.iter().enumerate().map(move |(index, output)| UtxoRecord {
            txid: self.id.clone(),
            index: index as u32,
            address: output.address.clone(),
            amount: output.amount,
            public_key: output.public_key.clone(),
        })
    }

    /// Validates a transfer against a view of the unspent outputs
    ///
    /// Every input must resolve to a live output, be authorized by its
    /// declared public key and carry a valid signature; outputs plus fee
    /// must not exceed the resolved input value.
    pub fn validate<V: UtxoView + ?Sized>(&self, view: &V) -> Result<TransactionSummary, TransactionError> {
        if self.kind != TransactionKind::Transfer {
            return Err(TransactionError::NotTransfer(self.kind));
        }

        if self.inputs.is_empty() {
            return Err(TransactionError::NoInputs);
        }

        let expected = self.calculate_id();
        if expected != self.id {
            return Err(TransactionError::IdMismatch {
                expected,
                actual: self.id.clone(),
            });
        }

        if !self.fee.is_finite() || self.fee < 0.0 {
            return Err(TransactionError::InvalidAmount(format!("fee {}", self.fee)));
        }

        if let Some(output) = self
            .outputs
            .iter()
            .find(|output| !output.amount.is_finite() || output.amount < 0.0)
        {
            return Err(TransactionError::InvalidAmount(format!(
                "output amount {} to {}",
                output.amount, output.address
            )));
        }

        let mut seen = BTreeSet::new();
        let mut input_total = 0.0;

        for (position, input) in self.inputs.iter().enumerate() {
            let output = input.output_ref();
            if !seen.insert(output.clone()) {
                return Err(TransactionError::DuplicateInput(output));
            }

            let record = view
                .get_utxo(&output)
                .ok_or_else(|| TransactionError::UnknownInput(output.clone()))?;

            let public_key = parse_public_key(&input.public_key)?;
            if !record.is_spendable_by(&public_key) {
                return Err(TransactionError::UnauthorizedInput { position, output });
            }

            let signature = input
                .signature
                .as_ref()
                .ok_or(TransactionError::NotSigned { position })?;
            let message = self.signing_message(position);
            let verified = verify_signature(message.as_bytes(), signature, &public_key)
                .map_err(|_| TransactionError::InvalidSignature { position })?;
            if !verified {
                return Err(TransactionError::InvalidSignature { position });
            }

            input_total += record.amount;
        }

        let output_total = self.total_output();
        let required = output_total + self.fee;
        if required > input_total + AMOUNT_EPSILON {
            return Err(TransactionError::InsufficientFunds {
                required,
                available: input_total,
            });
        }

        Ok(TransactionSummary {
            input_total,
            output_total,
        })
    }
}
