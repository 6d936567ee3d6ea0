//! Registry of energy-producing nodes and the daily aggregation that
//! feeds the miner.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::consensus::ProofOfEnergy;
use super::crypto::Address;
use super::storage::{LedgerStorage, StorageError};
use super::transaction::Transaction;

/// Errors that can occur in the node registry
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid energy reading: {0}")]
    InvalidReading(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
}

/// One energy measurement reported by a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EnergyReading {
    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub timestamp: DateTime<Utc>,

    /// Energy produced, in Wh
    pub energy: f64,
}

/// A registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NodeRecord {
    pub node_id: String,

    /// Wallet the node's owner is paid to
    pub wallet: Address,

    #[schema(value_type = Option<String>)]
    pub last_validation: Option<DateTime<Utc>>,

    /// Readings not yet folded into a daily aggregate
    pub energy_history: Vec<EnergyReading>,
}

/// Input of one mining cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DailyData {
    /// Energy accepted across all nodes
    pub total_energy: f64,

    /// Number of nodes whose energy was accepted
    pub valid_node_count: u64,

    /// Transactions proposed for the block besides the pool's
    #[serde(default)]
    pub candidate_transactions: Vec<Transaction>,
}

/// A daily aggregate together with the readings it was built from
///
/// The readings stay in the registry until the snapshot is settled.
#[derive(Debug, Clone)]
pub struct DailySnapshot {
    pub daily: DailyData,
    taken_at: DateTime<Utc>,

    /// Accepted nodes and the length of their history when the snapshot was taken
    folded: Vec<(String, usize)>,
}

/// Registry of nodes, shared by request handlers and the miner
pub struct NodeRegistry {
    nodes: DashMap<String, NodeRecord>,
    consensus: Arc<ProofOfEnergy>,
    storage: Option<Arc<LedgerStorage>>,

    /// Held from snapshot to settlement so two cycles never fold the same readings
    cycle: Mutex<()>,
}

impl NodeRegistry {
    /// Creates an in-memory registry
    pub fn new(consensus: Arc<ProofOfEnergy>) -> Self {
        NodeRegistry {
            nodes: DashMap::new(),
            consensus,
            storage: None,
            cycle: Mutex::new(()),
        }
    }

    /// Creates a registry backed by `storage`, loading the nodes saved there
    pub fn with_storage(
        storage: Arc<LedgerStorage>,
        consensus: Arc<ProofOfEnergy>,
    ) -> Result<Self, NodeError> {
        let nodes = DashMap::new();
        for node in storage.get_all_nodes()? {
            nodes.insert(node.node_id.clone(), node);
        }
        info!("Loaded {} registered nodes", nodes.len());

        Ok(NodeRegistry {
            nodes,
            consensus,
            storage: Some(storage),
            cycle: Mutex::new(()),
        })
    }

    /// Registers (or re-registers) a node, clearing its history
    pub fn register_node(&self, node_id: &str, wallet: Address) -> Result<NodeRecord, NodeError> {
        let node = NodeRecord {
            node_id: node_id.to_string(),
            wallet,
            last_validation: None,
            energy_history: Vec::new(),
        };

        self.save(&node)?;
        self.nodes.insert(node.node_id.clone(), node.clone());
        info!("Registered node {} paying to {}", node.node_id, node.wallet);
        Ok(node)
    }

    /// Appends a reading to a node's history
    pub fn record_energy(&self, node_id: &str, reading: EnergyReading) -> Result<(), NodeError> {
        if !reading.energy.is_finite() || reading.energy < 0.0 {
            return Err(NodeError::InvalidReading(format!(
                "{} Wh from {}",
                reading.energy, node_id
            )));
        }

        let mut node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| NodeError::UnknownNode(node_id.to_string()))?;

        node.energy_history.push(reading);
        self.save(&node)
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.get(node_id).map(|node| node.clone())
    }

    pub fn get_all_nodes(&self) -> Vec<NodeRecord> {
        let mut nodes: Vec<NodeRecord> = self.nodes.iter().map(|node| node.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Serializes mining cycles over this registry
    pub fn begin_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Folds the last day of readings of every valid node into one total
    ///
    /// Nothing is modified: the readings are only consumed by [`settle`],
    /// once the cycle built on the total has committed.
    ///
    /// [`settle`]: NodeRegistry::settle
    pub fn snapshot_daily(&self, now: DateTime<Utc>) -> DailySnapshot {
        let cutoff = now - Duration::days(1);
        let mut daily = DailyData::default();
        let mut folded = Vec::new();

        for node in self.nodes.iter() {
            let node_energy: f64 = node
                .energy_history
                .iter()
                .filter(|reading| reading.timestamp >= cutoff)
                .map(|reading| reading.energy)
                .sum();

            if !self.consensus.validate(&node.node_id, node_energy) {
                warn!("Energy of node {} rejected for this cycle", node.node_id);
                continue;
            }

            daily.total_energy += node_energy;
            daily.valid_node_count += 1;
            folded.push((node.node_id.clone(), node.energy_history.len()));
        }

        info!(
            "Aggregated {} Wh from {} nodes",
            daily.total_energy, daily.valid_node_count
        );
        DailySnapshot {
            daily,
            taken_at: now,
            folded,
        }
    }

    /// Drops the readings folded into `snapshot` and marks their nodes validated
    ///
    /// Readings recorded after the snapshot are kept. Every node is settled
    /// in memory even if saving one of them fails; the first error is returned.
    pub fn settle(&self, snapshot: &DailySnapshot) -> Result<(), NodeError> {
        let mut first_error = None;

        for (node_id, folded) in &snapshot.folded {
            let mut node = match self.nodes.get_mut(node_id) {
                Some(node) => node,
                None => continue,
            };

            let folded = (*folded).min(node.energy_history.len());
            node.energy_history.drain(..folded);
            node.last_validation = Some(snapshot.taken_at);

            if let Err(err) = self.save(&node) {
                error!("Failed to save settled node {}: {}", node_id, err);
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn save(&self, node: &NodeRecord) -> Result<(), NodeError> {
        if let Some(storage) = &self.storage {
            storage.save_node(node)?;
        }
        Ok(())
    }
}
