//! Observation ingest: resolve vendor ids and upsert raw rows.
//!
//! Extractors hand their raw records here; the writer resolves each
//! vendor-native id through the registry as of the observation date, then
//! upserts the row keyed by canonical symbol. An id that fails to resolve
//! rejects the record, never the batch.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ErrorCategory, ErrorClassification};
use crate::store::{ObservationStore, StoreError, SymbologyStore};
use crate::symbology::{RegistryError, SymbologyRegistry, Tsid};
use crate::vendor::CONSENSUS_VENDOR;

use super::{Observation, VendorObservation};

/// Ingest errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WriteError {
    /// The reserved consensus vendor may never write raw observations
    #[error("Source '{0}' is reserved for consensus output")]
    ReservedSource(String),

    #[error("Negative value {value} for {field}")]
    NegativeValue {
        field: crate::observation::Field,
        value: Decimal,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ErrorClassification for WriteError {
    fn category(&self) -> ErrorCategory {
        match self {
            WriteError::ReservedSource(_) => ErrorCategory::Permanent,
            WriteError::NegativeValue { .. } => ErrorCategory::Permanent,
            WriteError::Registry(err) => err.category(),
            WriteError::Store(err) => err.category(),
        }
    }
}

/// Aggregate result of an ingest batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub written: usize,
    /// Records rejected individually, with the rejection reason
    pub rejected: Vec<(String, String)>,
}

/// Writes vendor observations keyed by canonical symbol.
pub struct ObservationWriter<S> {
    store: Arc<S>,
    registry: SymbologyRegistry<S>,
}

impl<S: SymbologyStore + ObservationStore> ObservationWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        let registry = SymbologyRegistry::new(Arc::clone(&store));
        Self { store, registry }
    }

    /// Write one vendor observation, returning the canonical symbol it
    /// resolved to.
    pub async fn write(&self, observation: &VendorObservation) -> Result<Tsid, WriteError> {
        if observation.source == CONSENSUS_VENDOR {
            return Err(WriteError::ReservedSource(observation.source.clone()));
        }
        if observation.value.is_sign_negative() {
            return Err(WriteError::NegativeValue {
                field: observation.field,
                value: observation.value,
            });
        }

        let symbol = self
            .registry
            .resolve(
                &observation.source,
                &observation.source_id,
                Some(observation.date),
            )
            .await?;

        let row = Observation::new(
            symbol.tsid.clone(),
            observation.source.clone(),
            observation.date,
            observation.field,
            observation.value,
            Utc::now(),
        );
        self.store.upsert_observation(&row).await?;

        debug!(
            tsid = %symbol.tsid,
            vendor = %observation.source,
            date = %observation.date,
            field = %observation.field,
            "wrote observation"
        );
        Ok(symbol.tsid)
    }

    /// Write a batch, isolating per-record failures.
    pub async fn write_batch(&self, batch: &[VendorObservation]) -> IngestReport {
        let mut report = IngestReport {
            run_id: Uuid::new_v4(),
            ..Default::default()
        };

        for observation in batch {
            match self.write(observation).await {
                Ok(_) => report.written += 1,
                Err(err) => {
                    warn!(
                        source = %observation.source,
                        source_id = %observation.source_id,
                        %err,
                        "rejected observation"
                    );
                    report
                        .rejected
                        .push((observation.source_id.clone(), err.to_string()));
                }
            }
        }

        report
    }
}
