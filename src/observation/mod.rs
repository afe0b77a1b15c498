//! Time-series observations keyed by canonical symbol.
//!
//! A raw observation is one (tsid, vendor, date, field, value) tuple. Raw
//! observations are written by vendor extractors through the
//! [`ObservationWriter`], which resolves vendor-native ids at write time, and
//! are read-only input to the consensus engine.

mod extract;
mod writer;

pub use extract::*;
pub use writer::*;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::symbology::Tsid;

/// Observed field of a daily record.
///
/// Price fields compare under relative tolerance during consensus; volume and
/// corporate-action fields must match exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
    ExDividend,
    SplitRatio,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Open => "open",
            Field::High => "high",
            Field::Low => "low",
            Field::Close => "close",
            Field::Volume => "volume",
            Field::ExDividend => "ex_dividend",
            Field::SplitRatio => "split_ratio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Field::Open),
            "high" => Some(Field::High),
            "low" => Some(Field::Low),
            "close" => Some(Field::Close),
            "volume" => Some(Field::Volume),
            "ex_dividend" => Some(Field::ExDividend),
            "split_ratio" => Some(Field::SplitRatio),
            _ => None,
        }
    }

    /// Discrete fields require exact agreement between vendors
    pub fn is_discrete(&self) -> bool {
        matches!(self, Field::Volume | Field::ExDividend | Field::SplitRatio)
    }

    /// All known fields, in storage order
    pub fn all() -> [Field; 7] {
        [
            Field::Open,
            Field::High,
            Field::Low,
            Field::Close,
            Field::Volume,
            Field::ExDividend,
            Field::SplitRatio,
        ]
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw per-vendor observation, keyed by canonical symbol.
///
/// At most one row exists per (tsid, vendor, date, field); later writes for
/// the same key replace the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub tsid: Tsid,
    pub vendor: String,
    pub date: NaiveDate,
    pub field: Field,
    pub value: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        tsid: Tsid,
        vendor: impl Into<String>,
        date: NaiveDate,
        field: Field,
        value: Decimal,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tsid,
            vendor: vendor.into(),
            date,
            field,
            value,
            updated_at,
        }
    }
}

/// One observation as produced by a vendor extractor, keyed by the vendor's
/// own identifier. Resolved to a tsid at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorObservation {
    /// Vendor/source name, as registered in the symbology
    pub source: String,
    /// Vendor-native identifier
    pub source_id: String,
    pub date: NaiveDate,
    pub field: Field,
    pub value: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_roundtrip() {
        for field in Field::all() {
            assert_eq!(Field::parse(field.as_str()), Some(field));
        }
        assert_eq!(Field::parse("unknown"), None);
    }

    #[test]
    fn test_field_tolerance_class() {
        assert!(!Field::Close.is_discrete());
        assert!(!Field::Open.is_discrete());
        assert!(Field::Volume.is_discrete());
        assert!(Field::SplitRatio.is_discrete());
    }
}
