//! Cross-source consensus reconciliation.
//!
//! For each (canonical symbol, date, field) the engine reads every vendor's
//! raw observation, applies the vendor trust weights and writes one consensus
//! observation. Consensus rows are derived data: they are replaced wholesale
//! on recomputation and never hand-edited.

mod engine;

pub use engine::*;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConsensusSettings;
use crate::error::{ErrorCategory, ErrorClassification};
use crate::observation::Field;
use crate::store::StoreError;
use crate::symbology::{RegistryError, Tsid};
use crate::vendor::VendorError;

/// Derived consensus value for one (symbol, date, field).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusObservation {
    pub tsid: Tsid,
    pub date: NaiveDate,
    pub field: Field,
    /// Winning value
    pub value: Decimal,
    /// Vendors agreeing with the winning value, sorted by name
    pub vendors: Vec<String>,
    /// Sum of the agreeing vendors' weights
    pub total_weight: u32,
    /// Timestamp of the weight snapshot the row was computed from
    pub computed_at: DateTime<Utc>,
}

/// How much history a recompute replaces.
///
/// Always explicit and caller-controlled; the engine never infers a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecomputeMode {
    /// Recompute and overwrite all historical consensus rows
    Full,
    /// Recompute only rows dated within the most recent `days` days,
    /// leaving older consensus rows untouched
    Window { days: u32 },
}

impl RecomputeMode {
    /// Exclusive lower date bound for the recompute, if any.
    ///
    /// Rows dated on or before the cutoff are out of scope.
    pub fn cutoff(&self, as_of: NaiveDate) -> Option<NaiveDate> {
        match self {
            RecomputeMode::Full => None,
            RecomputeMode::Window { days } => Some(as_of - Duration::days(i64::from(*days))),
        }
    }
}

/// Agreement policy for consensus scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusPolicy {
    /// Relative tolerance for continuous (price) fields, as a fraction
    pub relative_tolerance: Decimal,
}

impl ConsensusPolicy {
    /// Build the policy from settings, parsing the tolerance string
    pub fn from_settings(settings: &ConsensusSettings) -> Result<Self, ConsensusError> {
        let relative_tolerance = settings
            .tolerance
            .parse::<Decimal>()
            .map_err(|_| ConsensusError::InvalidTolerance(settings.tolerance.clone()))?;
        if relative_tolerance.is_sign_negative() {
            return Err(ConsensusError::InvalidTolerance(settings.tolerance.clone()));
        }
        Ok(Self { relative_tolerance })
    }

    /// Whether two vendor values agree for the given field.
    ///
    /// Discrete fields require exact equality; continuous fields compare
    /// within the relative tolerance, anchored at the candidate value `a`.
    pub fn agrees(&self, field: Field, a: Decimal, b: Decimal) -> bool {
        if field.is_discrete() {
            a == b
        } else {
            (a - b).abs() <= self.relative_tolerance * a.abs()
        }
    }
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            // 0.1%
            relative_tolerance: Decimal::new(1, 3),
        }
    }
}

/// Consensus engine errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConsensusError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Vendor(#[from] VendorError),

    #[error("Invalid consensus tolerance: '{0}'")]
    InvalidTolerance(String),
}

impl ErrorClassification for ConsensusError {
    fn category(&self) -> ErrorCategory {
        match self {
            ConsensusError::Registry(err) => err.category(),
            ConsensusError::Store(err) => err.category(),
            ConsensusError::Vendor(_) => ErrorCategory::Configuration,
            ConsensusError::InvalidTolerance(_) => ErrorCategory::Configuration,
        }
    }
}

/// Outcome of a consensus recompute for one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolOutcome {
    pub tsid: Tsid,
    /// Consensus rows written
    pub rows_written: usize,
    /// Prior consensus rows removed from the recompute scope
    pub rows_deleted: u64,
}

/// Aggregate result of a recompute across the symbol universe.
///
/// Per-symbol failures are isolated here; they never abort sibling symbols.
#[derive(Debug)]
pub struct ConsensusReport {
    pub run_id: Uuid,
    pub mode: RecomputeMode,
    pub outcomes: Vec<SymbolOutcome>,
    /// Symbols whose computation failed, with the failure message
    pub failed: Vec<(Tsid, String)>,
    /// Symbols skipped because registry integrity checks failed
    pub halted: Vec<Tsid>,
    /// Whether the run was cancelled before covering every symbol
    pub cancelled: bool,
}

impl ConsensusReport {
    /// Total consensus rows written across all symbols
    pub fn rows_written(&self) -> usize {
        self.outcomes.iter().map(|o| o.rows_written).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_window_cutoff() {
        let as_of = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        assert_eq!(RecomputeMode::Full.cutoff(as_of), None);
        assert_eq!(
            RecomputeMode::Window { days: 30 }.cutoff(as_of),
            Some(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
    }

    #[test]
    fn test_continuous_tolerance() {
        let policy = ConsensusPolicy::default();
        // 0.1% of 10.00 is 0.01
        assert!(policy.agrees(Field::Close, dec!(10.00), dec!(10.01)));
        assert!(!policy.agrees(Field::Close, dec!(10.00), dec!(10.05)));
    }

    #[test]
    fn test_discrete_exact_match() {
        let policy = ConsensusPolicy::default();
        assert!(policy.agrees(Field::Volume, dec!(1000), dec!(1000)));
        assert!(!policy.agrees(Field::Volume, dec!(1000), dec!(1001)));
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = ConsensusSettings {
            tolerance: "0.002".to_string(),
            ..Default::default()
        };
        let policy = ConsensusPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.relative_tolerance, dec!(0.002));

        let bad = ConsensusSettings {
            tolerance: "lots".to_string(),
            ..Default::default()
        };
        assert!(ConsensusPolicy::from_settings(&bad).is_err());
    }
}
