//! In-memory store backend.
//!
//! Keeps the same semantics as the PostgreSQL backend (upsert keys, ordering,
//! supersession, atomic symbol creation) behind a single lock. Used by the
//! test suite and small single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;

use crate::consensus::ConsensusObservation;
use crate::observation::{Field, Observation};
use crate::symbology::{CanonicalSymbol, SymbologyMapping, Tsid};

use super::{ObservationStore, StoreError, StoreResult, SymbologyStore};

#[derive(Default)]
struct Inner {
    symbols: BTreeMap<Tsid, CanonicalSymbol>,
    /// Mappings in insertion order; supersession updates rows in place
    mappings: Vec<SymbologyMapping>,
    /// Keyed so iteration yields date-ascending, vendor-ascending order
    observations: BTreeMap<(Tsid, Field, NaiveDate, String), Observation>,
    consensus: BTreeMap<(Tsid, Field, NaiveDate), ConsensusObservation>,
}

/// In-memory reference-data store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of raw observation rows held (for tests and diagnostics)
    pub fn observation_count(&self) -> usize {
        self.inner.read().observations.len()
    }
}

#[async_trait]
impl SymbologyStore for MemoryStore {
    async fn create_symbol(
        &self,
        symbol: &CanonicalSymbol,
        mapping: &SymbologyMapping,
    ) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if inner.symbols.contains_key(&symbol.tsid) {
            return Err(StoreError::Constraint(format!(
                "canonical symbol {} already exists",
                symbol.tsid
            )));
        }
        if inner
            .mappings
            .iter()
            .any(|m| m.source == mapping.source && m.source_id == mapping.source_id && m.is_current())
        {
            return Err(StoreError::Constraint(format!(
                "active mapping already exists for ({}, {})",
                mapping.source, mapping.source_id
            )));
        }
        inner.symbols.insert(symbol.tsid.clone(), symbol.clone());
        inner.mappings.push(mapping.clone());
        Ok(())
    }

    async fn update_symbol(&self, symbol: &CanonicalSymbol) -> StoreResult<()> {
        let mut inner = self.inner.write();
        match inner.symbols.get_mut(&symbol.tsid) {
            Some(existing) => {
                *existing = symbol.clone();
                Ok(())
            }
            None => Err(StoreError::InvalidData(format!(
                "unknown canonical symbol {}",
                symbol.tsid
            ))),
        }
    }

    async fn symbol(&self, tsid: &Tsid) -> StoreResult<Option<CanonicalSymbol>> {
        Ok(self.inner.read().symbols.get(tsid).cloned())
    }

    async fn active_symbol_for_listing(
        &self,
        ticker: &str,
        exchange: &str,
    ) -> StoreResult<Option<CanonicalSymbol>> {
        Ok(self
            .inner
            .read()
            .symbols
            .values()
            .find(|s| s.active && s.ticker == ticker && s.exchange == exchange)
            .cloned())
    }

    async fn max_duplicate_index(&self, ticker: &str, exchange: &str) -> StoreResult<Option<u32>> {
        Ok(self
            .inner
            .read()
            .symbols
            .keys()
            .filter(|t| t.ticker() == ticker && t.exchange() == exchange)
            .map(|t| t.duplicate_index())
            .max())
    }

    async fn insert_mapping(&self, mapping: &SymbologyMapping) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if mapping.is_current()
            && inner
                .mappings
                .iter()
                .any(|m| m.source == mapping.source && m.source_id == mapping.source_id && m.is_current())
        {
            return Err(StoreError::Constraint(format!(
                "active mapping already exists for ({}, {})",
                mapping.source, mapping.source_id
            )));
        }
        inner.mappings.push(mapping.clone());
        Ok(())
    }

    async fn close_mapping(
        &self,
        source: &str,
        source_id: &str,
        valid_until: NaiveDate,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        let mut closed = 0;
        for mapping in inner
            .mappings
            .iter_mut()
            .filter(|m| m.source == source && m.source_id == source_id && m.is_current())
        {
            mapping.valid_until = Some(valid_until);
            mapping.updated_at = updated_at;
            closed += 1;
        }
        Ok(closed)
    }

    async fn mappings_for_source_id(
        &self,
        source: &str,
        source_id: &str,
    ) -> StoreResult<Vec<SymbologyMapping>> {
        Ok(self
            .inner
            .read()
            .mappings
            .iter()
            .filter(|m| m.source == source && m.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn mappings_for_symbol(&self, tsid: &Tsid) -> StoreResult<Vec<SymbologyMapping>> {
        Ok(self
            .inner
            .read()
            .mappings
            .iter()
            .filter(|m| m.tsid == *tsid)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn upsert_observation(&self, observation: &Observation) -> StoreResult<()> {
        let key = (
            observation.tsid.clone(),
            observation.field,
            observation.date,
            observation.vendor.clone(),
        );
        self.inner.write().observations.insert(key, observation.clone());
        Ok(())
    }

    async fn query_observations(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>> {
        Ok(self
            .inner
            .read()
            .observations
            .iter()
            .filter(|((t, f, d, _), _)| {
                t == tsid
                    && *f == field
                    && start.map_or(true, |s| *d >= s)
                    && end.map_or(true, |e| *d < e)
            })
            .map(|(_, obs)| obs.clone())
            .collect())
    }

    async fn observations_for_symbol(
        &self,
        tsid: &Tsid,
        cutoff: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>> {
        let mut rows: Vec<Observation> = self
            .inner
            .read()
            .observations
            .iter()
            .filter(|((t, _, d, _), _)| t == tsid && cutoff.map_or(true, |c| *d > c))
            .map(|(_, obs)| obs.clone())
            .collect();
        rows.sort_by(|a, b| {
            (a.date, a.field, a.vendor.as_str()).cmp(&(b.date, b.field, b.vendor.as_str()))
        });
        Ok(rows)
    }

    async fn upsert_consensus(&self, row: &ConsensusObservation) -> StoreResult<()> {
        let key = (row.tsid.clone(), row.field, row.date);
        self.inner.write().consensus.insert(key, row.clone());
        Ok(())
    }

    async fn delete_consensus(&self, tsid: &Tsid, cutoff: Option<NaiveDate>) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        let before = inner.consensus.len();
        inner
            .consensus
            .retain(|(t, _, d), _| !(t == tsid && cutoff.map_or(true, |c| *d > c)));
        Ok((before - inner.consensus.len()) as u64)
    }

    async fn query_consensus(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<ConsensusObservation>> {
        Ok(self
            .inner
            .read()
            .consensus
            .iter()
            .filter(|((t, f, d), _)| {
                t == tsid
                    && *f == field
                    && start.map_or(true, |s| *d >= s)
                    && end.map_or(true, |e| *d < e)
            })
            .map(|(_, row)| row.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbology::MappingType;
    use rust_decimal_macros::dec;

    fn tsid() -> Tsid {
        Tsid::new("AAPL", "Q", 0)
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    #[tokio::test]
    async fn test_observation_upsert_replaces() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = Observation::new(tsid(), "yahoo", date(1), Field::Close, dec!(10.00), now);
        let second = Observation::new(tsid(), "yahoo", date(1), Field::Close, dec!(10.10), now);
        store.upsert_observation(&first).await.unwrap();
        store.upsert_observation(&second).await.unwrap();

        let rows = store
            .query_observations(&tsid(), Field::Close, None, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, dec!(10.10));
    }

    #[tokio::test]
    async fn test_symbol_query_order() {
        let store = MemoryStore::new();
        let now = Utc::now();

        // Inserted out of order on purpose
        for (vendor, day) in [("zeta", 2), ("alpha", 2), ("alpha", 1)] {
            let obs = Observation::new(tsid(), vendor, date(day), Field::Close, dec!(1), now);
            store.upsert_observation(&obs).await.unwrap();
        }

        let rows = store.observations_for_symbol(&tsid(), None).await.unwrap();
        let keys: Vec<(NaiveDate, &str)> =
            rows.iter().map(|o| (o.date, o.vendor.as_str())).collect();
        assert_eq!(
            keys,
            vec![(date(1), "alpha"), (date(2), "alpha"), (date(2), "zeta")]
        );
    }

    #[tokio::test]
    async fn test_duplicate_active_mapping_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let symbol = CanonicalSymbol::new(tsid(), date(1), now);
        let mapping = SymbologyMapping::new(
            "csi",
            "12345",
            tsid(),
            MappingType::Stock,
            date(1),
            now,
        );
        store.create_symbol(&symbol, &mapping).await.unwrap();

        let duplicate = SymbologyMapping::new(
            "csi",
            "12345",
            Tsid::new("MSFT", "Q", 0),
            MappingType::Stock,
            date(2),
            now,
        );
        assert!(matches!(
            store.insert_mapping(&duplicate).await,
            Err(StoreError::Constraint(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_consensus_respects_cutoff() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for day in [1, 10, 20] {
            let row = ConsensusObservation {
                tsid: tsid(),
                date: date(day),
                field: Field::Close,
                value: dec!(10),
                vendors: vec!["yahoo".to_string()],
                total_weight: 50,
                computed_at: now,
            };
            store.upsert_consensus(&row).await.unwrap();
        }

        let deleted = store.delete_consensus(&tsid(), Some(date(10))).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining = store
            .query_consensus(&tsid(), Field::Close, None, None)
            .await
            .unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.date <= date(10)));
    }
}
