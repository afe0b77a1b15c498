//! Canonical symbol identity and cross-reference (symbology).
//!
//! This module owns the canonical identifier and the mapping between every
//! vendor-native identifier and that canonical id:
//! - Tsid: the canonical identifier, `<ticker>.<exchange>.<duplicate-index>`
//! - CanonicalSymbol: identity plus listing metadata and validity interval
//! - SymbologyMapping: one (source, source_id) -> tsid cross-reference
//! - SymbologyRegistry: resolve/register/reverse-lookup over a store
//! - LifecycleManager: builds and updates symbols from the reference feed

mod lifecycle;
mod registry;

pub use lifecycle::*;
pub use registry::*;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClassification};
use crate::store::StoreError;

/// Canonical trading-system identifier.
///
/// Formatted as `<ticker>.<exchange-abbrev>.<duplicate-index>`, e.g.
/// `AAPL.Q.0`. Immutable once assigned: a vendor renaming its own ticker
/// never rewrites an existing tsid, and a reused ticker gets a fresh
/// duplicate index rather than reusing a retired one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tsid {
    ticker: String,
    exchange: String,
    duplicate_index: u32,
}

impl Tsid {
    /// Create a tsid from its parts
    pub fn new(ticker: impl Into<String>, exchange: impl Into<String>, duplicate_index: u32) -> Self {
        Self {
            ticker: ticker.into(),
            exchange: exchange.into(),
            duplicate_index,
        }
    }

    /// Ticker portion as assigned at creation (not updated on renames)
    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    /// Exchange abbreviation portion
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Duplicate index disambiguating reused tickers
    pub fn duplicate_index(&self) -> u32 {
        self.duplicate_index
    }
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.ticker, self.exchange, self.duplicate_index)
    }
}

/// Tsid parse errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid tsid '{0}': expected <ticker>.<exchange>.<index>")]
pub struct TsidParseError(String);

impl FromStr for Tsid {
    type Err = TsidParseError;

    /// Parse from the canonical string form.
    ///
    /// Tickers may themselves contain dots (`BRK.B`), so the index and
    /// exchange are taken from the right.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '.');
        let index = parts.next().ok_or_else(|| TsidParseError(s.to_string()))?;
        let exchange = parts.next().ok_or_else(|| TsidParseError(s.to_string()))?;
        let ticker = parts.next().ok_or_else(|| TsidParseError(s.to_string()))?;

        if ticker.is_empty() || exchange.is_empty() {
            return Err(TsidParseError(s.to_string()));
        }
        let duplicate_index = index
            .parse::<u32>()
            .map_err(|_| TsidParseError(s.to_string()))?;

        Ok(Self::new(ticker, exchange, duplicate_index))
    }
}

impl TryFrom<String> for Tsid {
    type Error = TsidParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Tsid> for String {
    fn from(tsid: Tsid) -> Self {
        tsid.to_string()
    }
}

/// A canonical security with its listing metadata and validity interval.
///
/// Symbols are end-dated when delisted, never deleted. The `ticker` and
/// `exchange` fields track the backbone-authoritative listing and may move
/// away from the tsid's frozen ticker portion after a rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSymbol {
    /// Canonical identifier, immutable
    pub tsid: Tsid,
    /// Current ticker per the backbone-authoritative source
    pub ticker: String,
    /// Current exchange abbreviation per the backbone-authoritative source
    pub exchange: String,
    /// Whether the security is currently listed
    pub active: bool,
    /// First date the symbol is valid (inclusive)
    pub start_date: NaiveDate,
    /// Delisting date (exclusive); None while active
    pub end_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalSymbol {
    /// Create an active symbol whose listing matches its tsid
    pub fn new(tsid: Tsid, start_date: NaiveDate, created_at: DateTime<Utc>) -> Self {
        let ticker = tsid.ticker().to_string();
        let exchange = tsid.exchange().to_string();
        Self {
            tsid,
            ticker,
            exchange,
            active: true,
            start_date,
            end_date: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Whether the symbol's validity interval covers `date`
    pub fn covers(&self, date: NaiveDate) -> bool {
        date >= self.start_date && self.end_date.map_or(true, |end| date < end)
    }
}

/// Kind of instrument a mapping refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingType {
    Stock,
    Etf,
    Index,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingType::Stock => "stock",
            MappingType::Etf => "etf",
            MappingType::Index => "index",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stock" => Some(MappingType::Stock),
            "etf" => Some(MappingType::Etf),
            "index" => Some(MappingType::Index),
            _ => None,
        }
    }
}

/// One (source, source_id) -> tsid cross-reference.
///
/// Mappings are superseded, never deleted: when a vendor changes its own
/// identifier the old mapping is closed (`valid_until` set) and a new one
/// opened, both pointing at the same canonical symbol, so historical rows
/// keyed by the old identifier keep joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbologyMapping {
    /// Source name (vendor or reference feed)
    pub source: String,
    /// Vendor-native identifier
    pub source_id: String,
    /// Canonical symbol the identifier maps to
    pub tsid: Tsid,
    pub mapping_type: MappingType,
    /// First date the mapping is valid (inclusive)
    pub valid_from: NaiveDate,
    /// Supersession date (exclusive); None while current
    pub valid_until: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SymbologyMapping {
    pub fn new(
        source: impl Into<String>,
        source_id: impl Into<String>,
        tsid: Tsid,
        mapping_type: MappingType,
        valid_from: NaiveDate,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            source_id: source_id.into(),
            tsid,
            mapping_type,
            valid_from,
            valid_until: None,
            created_at,
            updated_at: created_at,
        }
    }

    /// Whether the mapping has not been superseded
    pub fn is_current(&self) -> bool {
        self.valid_until.is_none()
    }

    /// Whether the mapping was valid at `date`
    pub fn valid_at(&self, date: NaiveDate) -> bool {
        date >= self.valid_from && self.valid_until.map_or(true, |until| date < until)
    }
}

/// One record of the authoritative reference feed.
///
/// The loader that produces these (CSV, HTTP, whatever the feed speaks) is an
/// external collaborator; the lifecycle manager only consumes the records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Vendor-independent backbone identifier (e.g. a CSI-style number)
    pub backbone_id: String,
    pub ticker: String,
    pub exchange: String,
    pub is_active: bool,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
}

/// Registry and lifecycle errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RegistryError {
    /// No mapping (or symbol) matches the lookup
    #[error("Not found: no mapping for ({data_source}, {source_id})")]
    NotFound {
        data_source: String,
        source_id: String,
    },

    /// An active mapping for the pair already points at a different symbol
    #[error("Conflict: ({data_source}, {source_id}) is already mapped to {existing}")]
    Conflict {
        data_source: String,
        source_id: String,
        existing: Tsid,
    },

    /// Two concurrently valid mappings exist for the pair. Indicates registry
    /// corruption; must never be silently resolved by picking one.
    #[error("Ambiguous: {count} concurrently valid mappings for ({data_source}, {source_id})")]
    Ambiguous {
        data_source: String,
        source_id: String,
        count: usize,
    },

    /// Malformed reference record, rejected individually
    #[error("Invalid reference record '{backbone_id}': {reason}")]
    InvalidReferenceRecord { backbone_id: String, reason: String },

    #[error("Unknown canonical symbol: {0}")]
    UnknownSymbol(Tsid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorClassification for RegistryError {
    fn category(&self) -> ErrorCategory {
        match self {
            RegistryError::NotFound { .. } => ErrorCategory::Permanent,
            RegistryError::Conflict { .. } => ErrorCategory::Permanent,
            RegistryError::Ambiguous { .. } => ErrorCategory::Integrity,
            RegistryError::InvalidReferenceRecord { .. } => ErrorCategory::Permanent,
            RegistryError::UnknownSymbol(_) => ErrorCategory::Permanent,
            RegistryError::Store(err) => err.category(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tsid_display_roundtrip() {
        let tsid = Tsid::new("AAPL", "Q", 0);
        assert_eq!(tsid.to_string(), "AAPL.Q.0");
        assert_eq!("AAPL.Q.0".parse::<Tsid>().unwrap(), tsid);
    }

    #[test]
    fn test_tsid_parse_dotted_ticker() {
        let tsid: Tsid = "BRK.B.N.1".parse().unwrap();
        assert_eq!(tsid.ticker(), "BRK.B");
        assert_eq!(tsid.exchange(), "N");
        assert_eq!(tsid.duplicate_index(), 1);
    }

    #[test]
    fn test_tsid_parse_rejects_malformed() {
        assert!("AAPL".parse::<Tsid>().is_err());
        assert!("AAPL.Q".parse::<Tsid>().is_err());
        assert!("AAPL.Q.x".parse::<Tsid>().is_err());
        assert!(".Q.0".parse::<Tsid>().is_err());
    }

    #[test]
    fn test_symbol_covers_interval() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let mut symbol = CanonicalSymbol::new(Tsid::new("AAPL", "Q", 0), start, Utc::now());

        assert!(symbol.covers(start));
        assert!(!symbol.covers(start.pred_opt().unwrap()));

        let end = NaiveDate::from_ymd_opt(2022, 6, 1).unwrap();
        symbol.end_date = Some(end);
        assert!(symbol.covers(end.pred_opt().unwrap()));
        assert!(!symbol.covers(end));
    }

    #[test]
    fn test_mapping_validity() {
        let from = NaiveDate::from_ymd_opt(2021, 1, 1).unwrap();
        let mut mapping = SymbologyMapping::new(
            "quandl_wiki",
            "WIKI/AAPL",
            Tsid::new("AAPL", "Q", 0),
            MappingType::Stock,
            from,
            Utc::now(),
        );
        assert!(mapping.is_current());
        assert!(mapping.valid_at(from));

        let until = NaiveDate::from_ymd_opt(2021, 7, 1).unwrap();
        mapping.valid_until = Some(until);
        assert!(!mapping.is_current());
        assert!(!mapping.valid_at(until));
        assert!(mapping.valid_at(until.pred_opt().unwrap()));
    }
}
