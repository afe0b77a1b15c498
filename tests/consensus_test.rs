//! Consensus engine integration tests
//!
//! Full pipeline over the in-memory store: reference batch creates symbols,
//! vendor mappings are registered, observations flow through the writer, and
//! the engine reconciles them under a weight snapshot.

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use refdata_manager::symbology::MappingType;
use refdata_manager::{
    CancelFlag, ConsensusEngine, ConsensusPolicy, Field, LifecycleManager, MemoryStore,
    ObservationStore, RecomputeMode, ReferenceRecord, SymbologyRegistry, SymbologyStore, Tsid,
    Vendor, VendorObservation, ObservationWriter, WeightSnapshot,
};

const BACKBONE: &str = "csi";

fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Fixed as-of date for windowed tests
fn as_of() -> NaiveDate {
    date(2024, 3, 31)
}

fn snapshot(vendors: &[Vendor]) -> WeightSnapshot {
    let taken_at = Utc.with_ymd_and_hms(2024, 3, 31, 6, 0, 0).unwrap();
    WeightSnapshot::from_vendors(vendors, taken_at).unwrap()
}

struct Fixture {
    store: Arc<MemoryStore>,
    writer: ObservationWriter<MemoryStore>,
    engine: ConsensusEngine<MemoryStore>,
}

impl Fixture {
    /// Create `tickers` as canonical symbols and register each listed vendor
    /// source for all of them, using the ticker as the vendor-native id.
    async fn new(tickers: &[&str], sources: &[&str]) -> Self {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(Arc::clone(&store), BACKBONE);

        let records: Vec<ReferenceRecord> = tickers
            .iter()
            .enumerate()
            .map(|(i, ticker)| ReferenceRecord {
                backbone_id: format!("{}", 100 + i),
                ticker: ticker.to_string(),
                exchange: "Q".to_string(),
                is_active: true,
                start_date: date(2020, 1, 2),
                end_date: None,
            })
            .collect();
        let report = manager.apply_batch(&records, &CancelFlag::new()).await;
        assert_eq!(report.created, tickers.len());

        let registry = SymbologyRegistry::new(Arc::clone(&store));
        for ticker in tickers {
            let tsid = Tsid::new(*ticker, "Q", 0);
            for source in sources {
                registry
                    .register(source, ticker, &tsid, MappingType::Stock, date(2020, 1, 2))
                    .await
                    .unwrap();
            }
        }

        let writer = ObservationWriter::new(Arc::clone(&store));
        let engine = ConsensusEngine::new(Arc::clone(&store), ConsensusPolicy::default());
        Self {
            store,
            writer,
            engine,
        }
    }

    async fn write(&self, source: &str, ticker: &str, day: NaiveDate, field: Field, value: Decimal) {
        self.writer
            .write(&VendorObservation {
                source: source.to_string(),
                source_id: ticker.to_string(),
                date: day,
                field,
                value,
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_weighted_disagreement_selects_heavier_value() {
    let fx = Fixture::new(&["AAPL"], &["alpha", "beta"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);
    let day = date(2024, 3, 28);

    // Outside the 0.1% tolerance
    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
    fx.write("beta", "AAPL", day, Field::Close, dec!(10.05)).await;

    let weights = snapshot(&[
        Vendor::new("alpha", 80).unwrap(),
        Vendor::new("beta", 20).unwrap(),
    ]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, dec!(10.00));
    assert_eq!(rows[0].total_weight, 80);
    assert_eq!(rows[0].vendors, vec!["alpha"]);
}

#[tokio::test]
async fn test_agreement_records_all_contributors() {
    let fx = Fixture::new(&["AAPL"], &["alpha", "beta"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);
    let day = date(2024, 3, 28);

    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
    fx.write("beta", "AAPL", day, Field::Close, dec!(10.00)).await;

    let weights = snapshot(&[
        Vendor::new("alpha", 50).unwrap(),
        Vendor::new("beta", 50).unwrap(),
    ]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, dec!(10.00));
    assert_eq!(rows[0].total_weight, 100);
    assert_eq!(rows[0].vendors, vec!["alpha", "beta"]);
}

#[tokio::test]
async fn test_recompute_is_idempotent() {
    let fx = Fixture::new(&["AAPL"], &["alpha", "beta"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);

    for day in [date(2024, 3, 26), date(2024, 3, 27), date(2024, 3, 28)] {
        fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
        fx.write("alpha", "AAPL", day, Field::Volume, dec!(1000)).await;
        fx.write("beta", "AAPL", day, Field::Close, dec!(10.40)).await;
    }

    let weights = snapshot(&[
        Vendor::new("alpha", 60).unwrap(),
        Vendor::new("beta", 40).unwrap(),
    ]);

    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();
    let first = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();

    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();
    let second = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();

    // Bit-identical rows, no duplicates
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_zero_valid_observations_writes_no_row() {
    let fx = Fixture::new(&["AAPL"], &["alpha"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);

    // The only observation comes from a disabled vendor
    fx.write("alpha", "AAPL", date(2024, 3, 28), Field::Close, dec!(10.00))
        .await;

    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap().disabled()]);
    let outcome = fx
        .engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    assert_eq!(outcome.rows_written, 0);
    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_unknown_vendor_is_discarded() {
    let fx = Fixture::new(&["AAPL"], &["alpha", "beta"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);
    let day = date(2024, 3, 28);

    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
    fx.write("beta", "AAPL", day, Field::Close, dec!(99.99)).await;

    // beta has no configured weight at all
    let weights = snapshot(&[Vendor::new("alpha", 30).unwrap()]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, dec!(10.00));
    assert_eq!(rows[0].vendors, vec!["alpha"]);
}

#[tokio::test]
async fn test_windowed_recompute_leaves_old_rows_untouched() {
    let fx = Fixture::new(&["AAPL"], &["alpha"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);

    let old_day = date(2024, 2, 10); // > 30 days before as_of
    let recent_day = date(2024, 3, 26);

    fx.write("alpha", "AAPL", old_day, Field::Close, dec!(10.00)).await;
    fx.write("alpha", "AAPL", recent_day, Field::Close, dec!(20.00)).await;

    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap()]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    // Underlying raw data changes for both days
    fx.write("alpha", "AAPL", old_day, Field::Close, dec!(11.00)).await;
    fx.write("alpha", "AAPL", recent_day, Field::Close, dec!(21.00)).await;

    let outcome = fx
        .engine
        .recompute_symbol(
            &tsid,
            RecomputeMode::Window { days: 30 },
            &weights,
            as_of(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.rows_written, 1);

    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    // The old row kept its stale value; only the windowed row moved
    assert_eq!(rows[0].date, old_day);
    assert_eq!(rows[0].value, dec!(10.00));
    assert_eq!(rows[1].date, recent_day);
    assert_eq!(rows[1].value, dec!(21.00));
}

#[tokio::test]
async fn test_full_recompute_drops_rows_without_observations() {
    let fx = Fixture::new(&["AAPL"], &["alpha", "beta"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);
    let day = date(2024, 3, 28);

    fx.write("beta", "AAPL", day, Field::Close, dec!(10.00)).await;

    let both = snapshot(&[
        Vendor::new("alpha", 50).unwrap(),
        Vendor::new("beta", 50).unwrap(),
    ]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &both, as_of())
        .await
        .unwrap();
    assert_eq!(
        fx.store
            .query_consensus(&tsid, Field::Close, None, None)
            .await
            .unwrap()
            .len(),
        1
    );

    // beta is disabled: its lone observation no longer supports a row
    let alpha_only = snapshot(&[
        Vendor::new("alpha", 50).unwrap(),
        Vendor::new("beta", 50).unwrap().disabled(),
    ]);
    let outcome = fx
        .engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &alpha_only, as_of())
        .await
        .unwrap();

    assert_eq!(outcome.rows_written, 0);
    assert_eq!(outcome.rows_deleted, 1);
    assert!(fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_universe_recompute_across_worker_pool() {
    let fx = Fixture::new(&["AAPL", "MSFT", "ORCL"], &["alpha"]).await;
    let day = date(2024, 3, 28);

    for ticker in ["AAPL", "MSFT", "ORCL"] {
        fx.write("alpha", ticker, day, Field::Close, dec!(10.00)).await;
    }

    let tsids = vec![
        Tsid::new("AAPL", "Q", 0),
        Tsid::new("MSFT", "Q", 0),
        Tsid::new("ORCL", "Q", 0),
    ];
    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap()]);
    let report = fx
        .engine
        .recompute_universe(
            &tsids,
            RecomputeMode::Full,
            &weights,
            as_of(),
            2,
            &CancelFlag::new(),
        )
        .await;

    assert!(!report.cancelled);
    assert!(report.failed.is_empty());
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.rows_written(), 3);
    // Outcomes are reported in deterministic symbol order
    let order: Vec<&Tsid> = report.outcomes.iter().map(|o| &o.tsid).collect();
    assert_eq!(order, tsids.iter().collect::<Vec<_>>());
}

#[tokio::test]
async fn test_cancelled_universe_run_reports_cancellation() {
    let fx = Fixture::new(&["AAPL", "MSFT"], &["alpha"]).await;

    let cancel = CancelFlag::new();
    cancel.cancel();
    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap()]);
    let report = fx
        .engine
        .recompute_universe(
            &[Tsid::new("AAPL", "Q", 0), Tsid::new("MSFT", "Q", 0)],
            RecomputeMode::Full,
            &weights,
            as_of(),
            2,
            &cancel,
        )
        .await;

    assert!(report.cancelled);
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn test_ambiguous_registry_halts_symbol() {
    let fx = Fixture::new(&["AAPL", "MSFT"], &["alpha"]).await;
    let day = date(2024, 3, 28);
    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
    fx.write("alpha", "MSFT", day, Field::Close, dec!(30.00)).await;

    // Corrupt MSFT's registry data: a second concurrently valid mapping from
    // the same source, inserted behind the registry's back.
    let msft = Tsid::new("MSFT", "Q", 0);
    let rogue = refdata_manager::SymbologyMapping::new(
        "alpha",
        "MSFT-DUP",
        msft.clone(),
        MappingType::Stock,
        date(2020, 1, 2),
        Utc::now(),
    );
    fx.store.insert_mapping(&rogue).await.unwrap();

    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap()]);
    let report = fx
        .engine
        .recompute_universe(
            &[Tsid::new("AAPL", "Q", 0), msft.clone()],
            RecomputeMode::Full,
            &weights,
            as_of(),
            2,
            &CancelFlag::new(),
        )
        .await;

    // The corrupt symbol is halted, the healthy one still computes
    assert_eq!(report.halted, vec![msft.clone()]);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.outcomes[0].tsid, Tsid::new("AAPL", "Q", 0));
    assert!(fx
        .store
        .query_consensus(&msft, Field::Close, None, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_writer_rejects_unresolvable_and_reserved_sources() {
    let fx = Fixture::new(&["AAPL"], &["alpha"]).await;
    let day = date(2024, 3, 28);

    let batch = vec![
        VendorObservation {
            source: "alpha".to_string(),
            source_id: "AAPL".to_string(),
            date: day,
            field: Field::Close,
            value: dec!(10.00),
        },
        VendorObservation {
            source: "alpha".to_string(),
            source_id: "UNKNOWN".to_string(),
            date: day,
            field: Field::Close,
            value: dec!(10.00),
        },
        VendorObservation {
            source: "consensus".to_string(),
            source_id: "AAPL".to_string(),
            date: day,
            field: Field::Close,
            value: dec!(10.00),
        },
    ];

    let report = fx.writer.write_batch(&batch).await;
    assert_eq!(report.written, 1);
    assert_eq!(report.rejected.len(), 2);
    assert_eq!(fx.store.observation_count(), 1);
}

#[tokio::test]
async fn test_same_vendor_rewrite_upserts() {
    let fx = Fixture::new(&["AAPL"], &["alpha"]).await;
    let tsid = Tsid::new("AAPL", "Q", 0);
    let day = date(2024, 3, 28);

    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.00)).await;
    fx.write("alpha", "AAPL", day, Field::Close, dec!(10.25)).await;
    assert_eq!(fx.store.observation_count(), 1);

    let weights = snapshot(&[Vendor::new("alpha", 80).unwrap()]);
    fx.engine
        .recompute_symbol(&tsid, RecomputeMode::Full, &weights, as_of())
        .await
        .unwrap();

    let rows = fx
        .store
        .query_consensus(&tsid, Field::Close, None, None)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value, dec!(10.25));
}
