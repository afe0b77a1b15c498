//! Identifier registry: resolve, register and reverse-lookup vendor ids.
//!
//! The registry is the only writer of symbology mappings. Every mutation
//! supersedes rather than overwrites, so a resolve as of any historical date
//! keeps working after renames and delistings.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use crate::store::SymbologyStore;

use super::{CanonicalSymbol, MappingType, RegistryError, SymbologyMapping, Tsid};

/// Registry over a symbology store.
pub struct SymbologyRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for SymbologyRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: SymbologyStore> SymbologyRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Resolve a vendor-native identifier to its canonical symbol.
    ///
    /// `as_of` selects the mapping valid on that date; `None` means the
    /// current mapping. Two concurrently valid mappings indicate registry
    /// corruption and surface as [`RegistryError::Ambiguous`], never as a
    /// silent pick.
    pub async fn resolve(
        &self,
        source: &str,
        source_id: &str,
        as_of: Option<NaiveDate>,
    ) -> Result<CanonicalSymbol, RegistryError> {
        let mappings = self.store.mappings_for_source_id(source, source_id).await?;
        let matching: Vec<&SymbologyMapping> = mappings
            .iter()
            .filter(|m| match as_of {
                Some(date) => m.valid_at(date),
                None => m.is_current(),
            })
            .collect();

        match matching.len() {
            0 => Err(RegistryError::NotFound {
                data_source: source.to_string(),
                source_id: source_id.to_string(),
            }),
            1 => {
                let tsid = &matching[0].tsid;
                self.store
                    .symbol(tsid)
                    .await?
                    .ok_or_else(|| RegistryError::UnknownSymbol(tsid.clone()))
            }
            count => {
                warn!(
                    source,
                    source_id, count, "ambiguous symbology mappings detected"
                );
                Err(RegistryError::Ambiguous {
                    data_source: source.to_string(),
                    source_id: source_id.to_string(),
                    count,
                })
            }
        }
    }

    /// Register a vendor-native identifier for an existing canonical symbol.
    ///
    /// Re-registering the same pair for the same symbol is idempotent. If the
    /// same source already maps to the symbol under a different identifier,
    /// the vendor has changed its own id: the old mapping is closed and a new
    /// one opened, both pointing at the same symbol.
    pub async fn register(
        &self,
        source: &str,
        source_id: &str,
        tsid: &Tsid,
        mapping_type: MappingType,
        valid_from: NaiveDate,
    ) -> Result<SymbologyMapping, RegistryError> {
        let existing = self.store.mappings_for_source_id(source, source_id).await?;
        if let Some(current) = existing.iter().find(|m| m.is_current()) {
            if current.tsid == *tsid {
                debug!(source, source_id, %tsid, "mapping already registered");
                return Ok(current.clone());
            }
            return Err(RegistryError::Conflict {
                data_source: source.to_string(),
                source_id: source_id.to_string(),
                existing: current.tsid.clone(),
            });
        }

        if self.store.symbol(tsid).await?.is_none() {
            return Err(RegistryError::UnknownSymbol(tsid.clone()));
        }

        let now = Utc::now();

        // A vendor changing its own identifier supersedes its prior mapping,
        // keeping at most one current mapping per (symbol, source).
        let symbol_mappings = self.store.mappings_for_symbol(tsid).await?;
        for stale in symbol_mappings
            .iter()
            .filter(|m| m.source == source && m.is_current())
        {
            info!(
                source,
                old_id = %stale.source_id,
                new_id = source_id,
                %tsid,
                "vendor identifier changed, superseding mapping"
            );
            self.store
                .close_mapping(source, &stale.source_id, valid_from, now)
                .await?;
        }

        let mapping = SymbologyMapping::new(source, source_id, tsid.clone(), mapping_type, valid_from, now);
        self.store.insert_mapping(&mapping).await?;
        debug!(source, source_id, %tsid, "registered mapping");
        Ok(mapping)
    }

    /// Look up the current vendor-native identifier for a canonical symbol.
    pub async fn reverse_lookup(&self, tsid: &Tsid, source: &str) -> Result<String, RegistryError> {
        let mappings = self.store.mappings_for_symbol(tsid).await?;
        let current: Vec<&SymbologyMapping> = mappings
            .iter()
            .filter(|m| m.source == source && m.is_current())
            .collect();

        match current.len() {
            0 => Err(RegistryError::NotFound {
                data_source: source.to_string(),
                source_id: tsid.to_string(),
            }),
            1 => Ok(current[0].source_id.clone()),
            count => Err(RegistryError::Ambiguous {
                data_source: source.to_string(),
                source_id: tsid.to_string(),
                count,
            }),
        }
    }

    /// Check that a symbol's mappings satisfy the one-current-mapping-per-
    /// source invariant.
    ///
    /// An [`RegistryError::Ambiguous`] result marks the symbol's registry
    /// data as corrupt; dependent consensus computation halts for that symbol
    /// until it is manually resolved.
    pub async fn verify_symbol(&self, tsid: &Tsid) -> Result<(), RegistryError> {
        let mappings = self.store.mappings_for_symbol(tsid).await?;
        let mut current: Vec<&SymbologyMapping> =
            mappings.iter().filter(|m| m.is_current()).collect();
        current.sort_by(|a, b| a.source.cmp(&b.source));

        for window in current.windows(2) {
            if window[0].source == window[1].source {
                warn!(
                    %tsid,
                    source = %window[0].source,
                    "registry corruption: multiple current mappings for one source"
                );
                return Err(RegistryError::Ambiguous {
                    data_source: window[0].source.clone(),
                    source_id: tsid.to_string(),
                    count: current
                        .iter()
                        .filter(|m| m.source == window[0].source)
                        .count(),
                });
            }
        }
        Ok(())
    }
}
