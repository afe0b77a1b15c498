//! Identifier lifecycle manager.
//!
//! Consumes batches of authoritative reference records and produces or
//! updates canonical symbols and their backbone mappings: new listings,
//! renames, delistings, re-listings and ticker reuse.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ErrorClassification;
use crate::job::CancelFlag;
use crate::store::SymbologyStore;

use super::{
    CanonicalSymbol, MappingType, ReferenceRecord, RegistryError, SymbologyMapping,
    SymbologyRegistry, Tsid,
};

/// What happened to one reference record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    /// New canonical symbol created
    Created(Tsid),
    /// Delisted symbol re-listed under the same backbone identity
    Reactivated(Tsid),
    /// Backbone-authoritative ticker/exchange change applied
    Renamed(Tsid),
    /// Symbol end-dated and its mappings closed
    Delisted(Tsid),
    /// Record matched the stored state
    Unchanged(Tsid),
    /// Inactive record for a security never tracked
    SkippedInactive,
}

/// Aggregate result of applying one reference batch.
///
/// Rejected and failed records are isolated per record; they never abort
/// sibling records.
#[derive(Debug, Default)]
pub struct LifecycleReport {
    pub run_id: Uuid,
    pub created: usize,
    pub reactivated: usize,
    pub renamed: usize,
    pub delisted: usize,
    pub unchanged: usize,
    pub skipped_inactive: usize,
    /// Malformed records, with the rejection reason
    pub rejected: Vec<(String, String)>,
    /// Records whose apply failed, with the failure message
    pub failed: Vec<(String, String)>,
    /// Whether the batch was cancelled before covering every record
    pub cancelled: bool,
}

impl LifecycleReport {
    /// Records applied successfully in any way
    pub fn applied(&self) -> usize {
        self.created + self.reactivated + self.renamed + self.delisted + self.unchanged
    }
}

/// Builds and updates canonical symbols from the reference feed.
pub struct LifecycleManager<S> {
    store: Arc<S>,
    registry: SymbologyRegistry<S>,
    /// Source name the reference feed registers under (e.g. "csi")
    backbone_source: String,
}

impl<S: SymbologyStore> LifecycleManager<S> {
    pub fn new(store: Arc<S>, backbone_source: impl Into<String>) -> Self {
        let registry = SymbologyRegistry::new(Arc::clone(&store));
        Self {
            store,
            registry,
            backbone_source: backbone_source.into(),
        }
    }

    /// The registry sharing this manager's store
    pub fn registry(&self) -> &SymbologyRegistry<S> {
        &self.registry
    }

    /// Apply a batch of reference records.
    ///
    /// Each record is applied independently; malformed or failing records are
    /// reported and skipped. Cancellation is honored between records, keeping
    /// whatever progress was already committed.
    pub async fn apply_batch(
        &self,
        records: &[ReferenceRecord],
        cancel: &CancelFlag,
    ) -> LifecycleReport {
        let mut report = LifecycleReport {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };

        for record in records {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.apply_record(record).await {
                Ok(RecordOutcome::Created(tsid)) => {
                    info!(%tsid, backbone_id = %record.backbone_id, "created canonical symbol");
                    report.created += 1;
                }
                Ok(RecordOutcome::Reactivated(tsid)) => {
                    info!(%tsid, "re-listed canonical symbol");
                    report.reactivated += 1;
                }
                Ok(RecordOutcome::Renamed(tsid)) => {
                    info!(%tsid, ticker = %record.ticker, "applied backbone rename");
                    report.renamed += 1;
                }
                Ok(RecordOutcome::Delisted(tsid)) => {
                    info!(%tsid, "delisted canonical symbol");
                    report.delisted += 1;
                }
                Ok(RecordOutcome::Unchanged(_)) => report.unchanged += 1,
                Ok(RecordOutcome::SkippedInactive) => report.skipped_inactive += 1,
                Err(err @ RegistryError::InvalidReferenceRecord { .. }) => {
                    warn!(backbone_id = %record.backbone_id, %err, "rejected reference record");
                    report
                        .rejected
                        .push((record.backbone_id.clone(), err.to_string()));
                }
                Err(err) => {
                    warn!(
                        backbone_id = %record.backbone_id,
                        integrity = err.is_integrity(),
                        %err,
                        "failed to apply reference record"
                    );
                    report
                        .failed
                        .push((record.backbone_id.clone(), err.to_string()));
                }
            }
        }

        info!(
            run_id = %report.run_id,
            created = report.created,
            reactivated = report.reactivated,
            renamed = report.renamed,
            delisted = report.delisted,
            unchanged = report.unchanged,
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "reference batch applied"
        );
        report
    }

    /// Apply a single reference record.
    pub async fn apply_record(
        &self,
        record: &ReferenceRecord,
    ) -> Result<RecordOutcome, RegistryError> {
        validate_record(record)?;

        // The backbone id is the most stable external key; resolve it first,
        // considering superseded mappings so re-listings find their symbol.
        let mappings = self
            .store
            .mappings_for_source_id(&self.backbone_source, &record.backbone_id)
            .await?;

        let current: Vec<&SymbologyMapping> = mappings.iter().filter(|m| m.is_current()).collect();
        if current.len() > 1 {
            return Err(RegistryError::Ambiguous {
                data_source: self.backbone_source.clone(),
                source_id: record.backbone_id.clone(),
                count: current.len(),
            });
        }

        let latest = current
            .first()
            .copied()
            .or_else(|| mappings.iter().max_by_key(|m| (m.valid_from, m.created_at)));

        match latest {
            Some(mapping) => self.apply_known(record, mapping).await,
            None if !record.is_active => {
                debug!(backbone_id = %record.backbone_id, "inactive record for untracked security");
                Ok(RecordOutcome::SkippedInactive)
            }
            None => self.create_symbol(record).await,
        }
    }

    async fn apply_known(
        &self,
        record: &ReferenceRecord,
        mapping: &SymbologyMapping,
    ) -> Result<RecordOutcome, RegistryError> {
        let mut symbol = self
            .store
            .symbol(&mapping.tsid)
            .await?
            .ok_or_else(|| RegistryError::UnknownSymbol(mapping.tsid.clone()))?;

        if !record.is_active {
            if !symbol.active {
                return Ok(RecordOutcome::Unchanged(symbol.tsid));
            }
            return self.delist(&mut symbol, record.end_date).await;
        }

        if !symbol.active {
            return self.reactivate(&mut symbol, record).await;
        }

        if symbol.ticker != record.ticker || symbol.exchange != record.exchange {
            return self.rename(&mut symbol, record).await;
        }

        Ok(RecordOutcome::Unchanged(symbol.tsid))
    }

    /// Create a new canonical symbol with the next duplicate index.
    ///
    /// The index counts every prior use of (ticker, exchange), active or
    /// delisted; indices are never reused.
    async fn create_symbol(&self, record: &ReferenceRecord) -> Result<RecordOutcome, RegistryError> {
        let duplicate_index = self
            .store
            .max_duplicate_index(&record.ticker, &record.exchange)
            .await?
            .map(|max| max + 1)
            .unwrap_or(0);

        let tsid = Tsid::new(record.ticker.clone(), record.exchange.clone(), duplicate_index);
        let now = Utc::now();
        let mut symbol = CanonicalSymbol::new(tsid.clone(), record.start_date, now);
        symbol.end_date = record.end_date;
        let mapping = SymbologyMapping::new(
            &self.backbone_source,
            &record.backbone_id,
            tsid.clone(),
            MappingType::Stock,
            record.start_date,
            now,
        );

        // Atomic: a concurrent resolver never sees the symbol without its
        // backbone mapping.
        self.store.create_symbol(&symbol, &mapping).await?;
        Ok(RecordOutcome::Created(tsid))
    }

    /// Apply a backbone-authoritative ticker/exchange change.
    ///
    /// The tsid's frozen ticker portion is left alone; only the symbol's
    /// listing fields move. Vendor mappings keyed by their own identifiers
    /// are untouched here; each vendor's id change arrives through
    /// [`SymbologyRegistry::register`] when that vendor's feed catches up.
    async fn rename(
        &self,
        symbol: &mut CanonicalSymbol,
        record: &ReferenceRecord,
    ) -> Result<RecordOutcome, RegistryError> {
        if let Some(occupant) = self
            .store
            .active_symbol_for_listing(&record.ticker, &record.exchange)
            .await?
        {
            if occupant.tsid != symbol.tsid {
                return Err(RegistryError::Conflict {
                    data_source: self.backbone_source.clone(),
                    source_id: record.backbone_id.clone(),
                    existing: occupant.tsid,
                });
            }
        }

        symbol.ticker = record.ticker.clone();
        symbol.exchange = record.exchange.clone();
        symbol.updated_at = Utc::now();
        self.store.update_symbol(symbol).await?;
        Ok(RecordOutcome::Renamed(symbol.tsid.clone()))
    }

    /// End-date a symbol and close all of its current mappings.
    async fn delist(
        &self,
        symbol: &mut CanonicalSymbol,
        end_date: Option<NaiveDate>,
    ) -> Result<RecordOutcome, RegistryError> {
        let now = Utc::now();
        let end = end_date.unwrap_or_else(|| now.date_naive());

        symbol.active = false;
        symbol.end_date = Some(end);
        symbol.updated_at = now;
        self.store.update_symbol(symbol).await?;

        for mapping in self.store.mappings_for_symbol(&symbol.tsid).await? {
            if mapping.is_current() {
                self.store
                    .close_mapping(&mapping.source, &mapping.source_id, end, now)
                    .await?;
            }
        }

        Ok(RecordOutcome::Delisted(symbol.tsid.clone()))
    }

    /// Re-list a delisted symbol under the same backbone identity.
    ///
    /// The same underlying entity keeps its canonical symbol; only a
    /// different entity reusing the ticker gets a fresh duplicate index.
    async fn reactivate(
        &self,
        symbol: &mut CanonicalSymbol,
        record: &ReferenceRecord,
    ) -> Result<RecordOutcome, RegistryError> {
        if let Some(occupant) = self
            .store
            .active_symbol_for_listing(&record.ticker, &record.exchange)
            .await?
        {
            if occupant.tsid != symbol.tsid {
                return Err(RegistryError::Conflict {
                    data_source: self.backbone_source.clone(),
                    source_id: record.backbone_id.clone(),
                    existing: occupant.tsid,
                });
            }
        }

        symbol.active = true;
        symbol.end_date = None;
        symbol.ticker = record.ticker.clone();
        symbol.exchange = record.exchange.clone();
        symbol.updated_at = Utc::now();
        self.store.update_symbol(symbol).await?;

        // Reopen the backbone mapping closed at delisting
        self.registry
            .register(
                &self.backbone_source,
                &record.backbone_id,
                &symbol.tsid,
                MappingType::Stock,
                record.start_date,
            )
            .await?;

        Ok(RecordOutcome::Reactivated(symbol.tsid.clone()))
    }
}

fn validate_record(record: &ReferenceRecord) -> Result<(), RegistryError> {
    if record.ticker.trim().is_empty() {
        return Err(RegistryError::InvalidReferenceRecord {
            backbone_id: record.backbone_id.clone(),
            reason: "missing ticker".to_string(),
        });
    }
    if record.exchange.trim().is_empty() {
        return Err(RegistryError::InvalidReferenceRecord {
            backbone_id: record.backbone_id.clone(),
            reason: "missing exchange".to_string(),
        });
    }
    if let Some(end) = record.end_date {
        if end <= record.start_date {
            return Err(RegistryError::InvalidReferenceRecord {
                backbone_id: record.backbone_id.clone(),
                reason: format!("end date {} not after start date {}", end, record.start_date),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(backbone_id: &str, ticker: &str, exchange: &str) -> ReferenceRecord {
        ReferenceRecord {
            backbone_id: backbone_id.to_string(),
            ticker: ticker.to_string(),
            exchange: exchange.to_string(),
            is_active: true,
            start_date: NaiveDate::from_ymd_opt(2020, 1, 2).unwrap(),
            end_date: None,
        }
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        assert!(validate_record(&record("1", "AAPL", "Q")).is_ok());
        assert!(validate_record(&record("2", "", "Q")).is_err());
        assert!(validate_record(&record("3", "AAPL", " ")).is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_interval() {
        let mut rec = record("4", "AAPL", "Q");
        rec.end_date = Some(rec.start_date);
        assert!(validate_record(&rec).is_err());
    }
}
