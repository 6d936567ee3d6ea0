//! Proof of energy: gates block creation on reported energy and converts
//! validated energy into newly minted tokens.

use log::{debug, warn};

use std::fmt;
use std::sync::Arc;

/// Energy units (Wh) backing one token
pub const ENERGY_PER_TOKEN: f64 = 20_000.0;

/// Default relative tolerance between reported and measured energy
pub const DEFAULT_ENERGY_TOLERANCE: f64 = 0.05;

/// Independent source of energy measurements used to cross-check reports
pub trait EnergyOracle: Send + Sync {
    /// Measured energy for `node_id`, if the oracle has a reading
    fn measured_energy(&self, node_id: &str) -> Option<f64>;
}

/// The reward and consensus rules
#[derive(Clone)]
pub struct ProofOfEnergy {
    tolerance: f64,
    oracle: Option<Arc<dyn EnergyOracle>>,
}

impl fmt::Debug for ProofOfEnergy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofOfEnergy")
            .field("tolerance", &self.tolerance)
            .field("oracle", &self.oracle.is_some())
            .finish()
    }
}

impl Default for ProofOfEnergy {
    fn default() -> Self {
        Self::new(DEFAULT_ENERGY_TOLERANCE)
    }
}

impl ProofOfEnergy {
    pub fn new(tolerance: f64) -> Self {
        ProofOfEnergy {
            tolerance,
            oracle: None,
        }
    }

    /// Cross-checks reports against `oracle`
    pub fn with_oracle(mut self, oracle: Arc<dyn EnergyOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Decides whether `reported_energy` from `node_id` may back a block
    ///
    /// Negative or non-finite reports are refused. Without an independent
    /// measurement every other report is accepted.
    pub fn validate(&self, node_id: &str, reported_energy: f64) -> bool {
        if !reported_energy.is_finite() || reported_energy < 0.0 {
            warn!("Rejecting energy report {} from {}", reported_energy, node_id);
            return false;
        }

        let measured = match self.oracle.as_ref().and_then(|oracle| oracle.measured_energy(node_id)) {
            Some(measured) => measured,
            None => {
                debug!("No measurement for {}, accepting {}", node_id, reported_energy);
                return true;
            }
        };

        let deviation = (reported_energy - measured).abs();
        let accepted = deviation <= self.tolerance * measured.abs();
        if !accepted {
            warn!(
                "Energy report from {} deviates from measurement: reported {}, measured {}",
                node_id, reported_energy, measured
            );
        }
        accepted
    }

    /// Converts validated energy into a token amount
    pub fn mint(&self, validated_energy: f64) -> f64 {
        validated_energy.max(0.0) / ENERGY_PER_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedOracle(HashMap<String, f64>);

    impl EnergyOracle for FixedOracle {
        fn measured_energy(&self, node_id: &str) -> Option<f64> {
            self.0.get(node_id).copied()
        }
    }

    #[test]
    fn test_energy_per_token_is_pinned() {
        assert_eq!(ENERGY_PER_TOKEN, 20_000.0);

        let consensus = ProofOfEnergy::default();
        assert_eq!(consensus.mint(20_000.0), 1.0);
        assert_eq!(consensus.mint(50_000.0), 2.5);
        assert_eq!(consensus.mint(0.0), 0.0);
    }

    #[test]
    fn test_accepts_without_measurement() {
        let consensus = ProofOfEnergy::default();
        assert!(consensus.validate("daily_aggregate", 123.0));
        assert!(consensus.validate("daily_aggregate", 0.0));
    }

    #[test]
    fn test_rejects_nonsense_reports() {
        let consensus = ProofOfEnergy::default();
        assert!(!consensus.validate("node", -1.0));
        assert!(!consensus.validate("node", f64::NAN));
        assert!(!consensus.validate("node", f64::INFINITY));
    }

    #[test]
    fn test_tolerance_band() {
        let oracle = FixedOracle(HashMap::from([("node-1".to_string(), 1000.0)]));
        let consensus = ProofOfEnergy::new(0.05).with_oracle(Arc::new(oracle));

        assert!(consensus.validate("node-1", 1000.0));
        assert!(consensus.validate("node-1", 1049.0));
        assert!(consensus.validate("node-1", 951.0));
        assert!(!consensus.validate("node-1", 1051.0));
        assert!(!consensus.validate("node-1", 900.0));

        // Nodes the oracle has no reading for are accepted
        assert!(consensus.validate("node-2", 5000.0));
    }
}
