//! Storage layer for symbology and observations.
//!
//! The registry, lifecycle manager and consensus engine reach the underlying
//! store only through the repository traits here; no reconciliation logic
//! lives in a backend. Two backends ship: PostgreSQL ([`PgStore`]) and an
//! in-memory store ([`MemoryStore`]) with identical semantics.

mod memory;
mod postgres;

pub use memory::*;
pub use postgres::*;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::consensus::ConsensusObservation;
use crate::error::{ErrorCategory, ErrorClassification};
use crate::observation::{Field, Observation};
use crate::symbology::{CanonicalSymbol, SymbologyMapping, Tsid};

/// Storage errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A uniqueness constraint rejected the write (e.g. a second active
    /// mapping for the same (source, source_id) pair)
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl ErrorClassification for StoreError {
    fn category(&self) -> ErrorCategory {
        match self {
            StoreError::Database(_) => ErrorCategory::Transient,
            StoreError::Configuration(_) => ErrorCategory::Configuration,
            StoreError::Constraint(_) => ErrorCategory::Permanent,
            StoreError::InvalidData(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<std::time::Duration> {
        match self {
            StoreError::Database(_) => Some(std::time::Duration::from_millis(500)),
            _ => None,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for canonical symbols and their vendor mappings.
///
/// Mutations are append-only at the mapping level: mappings are closed by
/// setting `valid_until`, never deleted or rewritten, so historical
/// observation rows keep joining. Writes must be visible to every subsequent
/// read once the call returns.
#[async_trait]
pub trait SymbologyStore: Send + Sync {
    /// Atomically create a symbol together with its first mapping.
    ///
    /// Either both rows become visible or neither does; a concurrent resolver
    /// must never observe a half-created symbol.
    async fn create_symbol(
        &self,
        symbol: &CanonicalSymbol,
        mapping: &SymbologyMapping,
    ) -> StoreResult<()>;

    /// Update a symbol's mutable listing fields (ticker, exchange, active,
    /// end_date, updated_at)
    async fn update_symbol(&self, symbol: &CanonicalSymbol) -> StoreResult<()>;

    /// Fetch a symbol by canonical id
    async fn symbol(&self, tsid: &Tsid) -> StoreResult<Option<CanonicalSymbol>>;

    /// The active symbol currently listed as (ticker, exchange), if any
    async fn active_symbol_for_listing(
        &self,
        ticker: &str,
        exchange: &str,
    ) -> StoreResult<Option<CanonicalSymbol>>;

    /// Highest duplicate index ever assigned to (ticker, exchange), across
    /// active and delisted symbols. Indices are never reused.
    async fn max_duplicate_index(&self, ticker: &str, exchange: &str) -> StoreResult<Option<u32>>;

    /// Open a new mapping
    async fn insert_mapping(&self, mapping: &SymbologyMapping) -> StoreResult<()>;

    /// Close every current mapping for (source, source_id), returning how
    /// many were closed
    async fn close_mapping(
        &self,
        source: &str,
        source_id: &str,
        valid_until: NaiveDate,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// All mappings (current and superseded) for a (source, source_id) pair
    async fn mappings_for_source_id(
        &self,
        source: &str,
        source_id: &str,
    ) -> StoreResult<Vec<SymbologyMapping>>;

    /// All mappings (current and superseded) pointing at a symbol
    async fn mappings_for_symbol(&self, tsid: &Tsid) -> StoreResult<Vec<SymbologyMapping>>;
}

/// Persistence for raw and consensus observations.
///
/// Raw rows are upserted per (tsid, vendor, date, field); consensus rows per
/// (tsid, date, field). Queries return rows ordered by date ascending, then
/// vendor name ascending.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    /// Insert or replace the raw observation for its key
    async fn upsert_observation(&self, observation: &Observation) -> StoreResult<()>;

    /// Raw observations for one field of a symbol, optionally bounded to
    /// `[start, end)`, ordered by date then vendor
    async fn query_observations(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>>;

    /// Every raw observation for a symbol dated strictly after `cutoff`
    /// (all of them when `cutoff` is None), ordered by date then vendor
    async fn observations_for_symbol(
        &self,
        tsid: &Tsid,
        cutoff: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>>;

    /// Insert or replace the consensus row for its key
    async fn upsert_consensus(&self, row: &ConsensusObservation) -> StoreResult<()>;

    /// Delete consensus rows for a symbol dated strictly after `cutoff` (all
    /// of them when `cutoff` is None), returning how many were removed
    async fn delete_consensus(&self, tsid: &Tsid, cutoff: Option<NaiveDate>) -> StoreResult<u64>;

    /// Consensus rows for one field of a symbol, optionally bounded to
    /// `[start, end)`, ordered by date
    async fn query_consensus(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<ConsensusObservation>>;
}
