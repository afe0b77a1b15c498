//! Consensus engine: weighted cross-vendor value selection.
//!
//! Each (symbol, date, field) is scored independently. A value's score is the
//! sum of the weights of every vendor agreeing with it within tolerance; the
//! highest-scoring value wins, with ties broken by the single highest vendor
//! weight and then by vendor name so recomputation is fully deterministic.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::CancelFlag;
use crate::observation::Field;
use crate::store::{ObservationStore, SymbologyStore};
use crate::symbology::{RegistryError, SymbologyRegistry, Tsid};
use crate::vendor::WeightSnapshot;

use super::{
    ConsensusError, ConsensusObservation, ConsensusPolicy, ConsensusReport, RecomputeMode,
    SymbolOutcome,
};

/// One vendor's candidate value for a (date, field) key.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    vendor: String,
    value: Decimal,
    weight: u32,
}

/// Winning value with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Winner {
    value: Decimal,
    vendors: Vec<String>,
    total_weight: u32,
}

/// Select the consensus value among candidates for one field.
///
/// Candidates must be sorted by vendor name; the tie-break relies on it.
fn select_value(candidates: &[Candidate], field: Field, policy: &ConsensusPolicy) -> Option<Winner> {
    if candidates.is_empty() {
        return None;
    }

    let mut best: Option<(usize, u32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let total: u32 = candidates
            .iter()
            .filter(|other| policy.agrees(field, candidate.value, other.value))
            .map(|other| other.weight)
            .sum();

        let better = match best {
            None => true,
            Some((best_i, best_total)) => {
                let best_candidate = &candidates[best_i];
                total > best_total
                    || (total == best_total && candidate.weight > best_candidate.weight)
                // Equal totals and equal individual weights: the earlier
                // (lexicographically smaller) vendor already won.
            }
        };
        if better {
            best = Some((i, total));
        }
    }

    let (best_i, total_weight) = best?;
    let winner = &candidates[best_i];
    let vendors = candidates
        .iter()
        .filter(|other| policy.agrees(field, winner.value, other.value))
        .map(|other| other.vendor.clone())
        .collect();

    Some(Winner {
        value: winner.value,
        vendors,
        total_weight,
    })
}

/// Computes consensus observations from raw per-vendor observations.
pub struct ConsensusEngine<S> {
    store: Arc<S>,
    registry: SymbologyRegistry<S>,
    policy: ConsensusPolicy,
}

impl<S> Clone for ConsensusEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            policy: self.policy,
        }
    }
}

impl<S> ConsensusEngine<S>
where
    S: SymbologyStore + ObservationStore + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, policy: ConsensusPolicy) -> Self {
        let registry = SymbologyRegistry::new(Arc::clone(&store));
        Self {
            store,
            registry,
            policy,
        }
    }

    /// Recompute consensus rows for one symbol.
    ///
    /// Raw observations are read-only input. Consensus rows in the recompute
    /// scope are replaced wholesale: rows whose (date, field) no longer has
    /// any valid observation disappear, everything else is upserted. Keys
    /// with zero valid observations produce no row; their absence is the
    /// "no data" signal.
    pub async fn recompute_symbol(
        &self,
        tsid: &Tsid,
        mode: RecomputeMode,
        weights: &WeightSnapshot,
        as_of: NaiveDate,
    ) -> Result<SymbolOutcome, ConsensusError> {
        // A corrupt registry makes every downstream row suspect; halt this
        // symbol until it is manually resolved.
        self.registry.verify_symbol(tsid).await?;

        let cutoff = mode.cutoff(as_of);
        let observations = self.store.observations_for_symbol(tsid, cutoff).await?;

        // Group candidates per (date, field), dropping vendors absent from
        // the weight snapshot (inactive, unknown, or the consensus vendor
        // itself).
        let mut groups: BTreeMap<(NaiveDate, Field), Vec<Candidate>> = BTreeMap::new();
        for obs in observations {
            let Some(weight) = weights.weight(&obs.vendor) else {
                continue;
            };
            groups.entry((obs.date, obs.field)).or_default().push(Candidate {
                vendor: obs.vendor,
                value: obs.value,
                weight,
            });
        }

        let mut rows = Vec::new();
        for ((date, field), candidates) in groups {
            if let Some(winner) = select_value(&candidates, field, &self.policy) {
                rows.push(ConsensusObservation {
                    tsid: tsid.clone(),
                    date,
                    field,
                    value: winner.value,
                    vendors: winner.vendors,
                    total_weight: winner.total_weight,
                    computed_at: weights.taken_at(),
                });
            }
        }

        let rows_deleted = self.store.delete_consensus(tsid, cutoff).await?;
        for row in &rows {
            self.store.upsert_consensus(row).await?;
        }

        debug!(
            %tsid,
            written = rows.len(),
            deleted = rows_deleted,
            "recomputed consensus"
        );
        Ok(SymbolOutcome {
            tsid: tsid.clone(),
            rows_written: rows.len(),
            rows_deleted,
        })
    }

    /// Recompute consensus across a symbol universe on a bounded worker pool.
    ///
    /// Symbols are independent; per-symbol failures are collected, never
    /// propagated to siblings. Cancellation is honored between symbols;
    /// committed symbols are kept.
    pub async fn recompute_universe(
        &self,
        tsids: &[Tsid],
        mode: RecomputeMode,
        weights: &WeightSnapshot,
        as_of: NaiveDate,
        workers: usize,
        cancel: &CancelFlag,
    ) -> ConsensusReport {
        let run_id = Uuid::new_v4();
        let workers = workers.max(1);
        let weights = Arc::new(weights.clone());

        info!(
            %run_id,
            symbols = tsids.len(),
            workers,
            ?mode,
            "starting consensus recompute"
        );

        let mut report = ConsensusReport {
            run_id,
            mode,
            outcomes: Vec::new(),
            failed: Vec::new(),
            halted: Vec::new(),
            cancelled: false,
        };

        let mut queue: VecDeque<Tsid> = tsids.to_vec().into();
        let mut join_set: JoinSet<(Tsid, Result<SymbolOutcome, ConsensusError>)> = JoinSet::new();

        loop {
            while join_set.len() < workers && !cancel.is_cancelled() {
                let Some(tsid) = queue.pop_front() else { break };
                let engine = self.clone();
                let weights = Arc::clone(&weights);
                join_set.spawn(async move {
                    let result = engine.recompute_symbol(&tsid, mode, &weights, as_of).await;
                    (tsid, result)
                });
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };

            match joined {
                Ok((_, Ok(outcome))) => report.outcomes.push(outcome),
                Ok((tsid, Err(ConsensusError::Registry(RegistryError::Ambiguous { .. })))) => {
                    report.halted.push(tsid);
                }
                Ok((tsid, Err(err))) => {
                    warn!(%tsid, %err, "consensus recompute failed for symbol");
                    report.failed.push((tsid, err.to_string()));
                }
                Err(join_err) => {
                    warn!(%join_err, "consensus worker aborted");
                }
            }
        }

        report.cancelled = cancel.is_cancelled() && !queue.is_empty();
        report.outcomes.sort_by(|a, b| a.tsid.cmp(&b.tsid));
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report.halted.sort();

        info!(
            %run_id,
            completed = report.outcomes.len(),
            rows_written = report.rows_written(),
            failed = report.failed.len(),
            halted = report.halted.len(),
            cancelled = report.cancelled,
            "consensus recompute finished"
        );
        report
    }
}
