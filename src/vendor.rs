//! Data vendors and trust weights.
//!
//! Every raw observation is attributed to a vendor. Vendors carry an
//! operator-configured trust weight that the consensus engine uses to score
//! disagreeing values. Weights are snapshotted at the start of each recompute
//! so a run is reproducible regardless of concurrent weight edits.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound of the vendor trust weight range.
pub const MAX_WEIGHT: u32 = 100;

/// Reserved vendor name under which consensus rows are attributed.
///
/// Observations carrying this name are rejected at ingest and excluded from
/// weight snapshots, so the engine can never feed its own output back into
/// scoring.
pub const CONSENSUS_VENDOR: &str = "consensus";

/// Vendor configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VendorError {
    #[error("Vendor weight {weight} for '{name}' exceeds maximum of {MAX_WEIGHT}")]
    WeightOutOfRange { name: String, weight: u32 },

    #[error("Vendor name '{0}' is reserved")]
    ReservedName(String),
}

/// A data vendor with its operator-assigned trust weight.
///
/// Vendors are created by configuration and never auto-deleted; historical
/// observations must stay attributable even after a vendor is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vendor {
    /// Unique vendor name (e.g. "quandl_wiki", "yahoo")
    pub name: String,
    /// Trust weight in 0..=100
    pub weight: u32,
    /// Whether observations from this vendor participate in consensus
    pub active: bool,
}

impl Vendor {
    /// Create an active vendor, validating the weight bound and name
    pub fn new(name: impl Into<String>, weight: u32) -> Result<Self, VendorError> {
        let name = name.into();
        if name == CONSENSUS_VENDOR {
            return Err(VendorError::ReservedName(name));
        }
        if weight > MAX_WEIGHT {
            return Err(VendorError::WeightOutOfRange { name, weight });
        }
        Ok(Self {
            name,
            weight,
            active: true,
        })
    }

    /// Mark the vendor inactive
    pub fn disabled(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Immutable snapshot of vendor weights for one consensus run.
///
/// Only active vendors are included; observations from vendors missing here
/// are discarded during scoring. The snapshot timestamp is stamped onto the
/// consensus rows it produces, which keeps recomputation over unchanged
/// inputs bit-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightSnapshot {
    taken_at: DateTime<Utc>,
    weights: BTreeMap<String, u32>,
}

impl WeightSnapshot {
    /// Build a snapshot from the current vendor set
    pub fn from_vendors(vendors: &[Vendor], taken_at: DateTime<Utc>) -> Result<Self, VendorError> {
        let mut weights = BTreeMap::new();
        for vendor in vendors {
            if vendor.name == CONSENSUS_VENDOR {
                return Err(VendorError::ReservedName(vendor.name.clone()));
            }
            if vendor.weight > MAX_WEIGHT {
                return Err(VendorError::WeightOutOfRange {
                    name: vendor.name.clone(),
                    weight: vendor.weight,
                });
            }
            if vendor.active {
                weights.insert(vendor.name.clone(), vendor.weight);
            }
        }
        Ok(Self { taken_at, weights })
    }

    /// When the snapshot was taken
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Weight for a vendor, or None if unknown/inactive
    pub fn weight(&self, vendor: &str) -> Option<u32> {
        self.weights.get(vendor).copied()
    }

    /// Number of vendors in the snapshot
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True when no active vendors are configured
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
