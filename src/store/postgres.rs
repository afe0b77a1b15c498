//! PostgreSQL store backend.
//!
//! Runtime-checked queries over a connection pool. The symbology tables carry
//! partial unique indexes so the one-active-mapping and one-active-listing
//! invariants hold even under concurrent writers; the registry's own checks
//! surface the friendlier error first.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::DatabaseSettings;
use crate::consensus::ConsensusObservation;
use crate::observation::{Field, Observation};
use crate::symbology::{CanonicalSymbol, MappingType, SymbologyMapping, Tsid};

use super::{ObservationStore, StoreError, StoreResult, SymbologyStore};

/// PostgreSQL-backed reference-data store.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from settings
    pub async fn from_settings(settings: &DatabaseSettings) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&settings.url)
            .await?;

        Ok(Self::new(pool))
    }

    /// Get the database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        info!("Ensuring reference-data schema...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canonical_symbol (
                tsid            VARCHAR(48) PRIMARY KEY,
                ticker          VARCHAR(32) NOT NULL,
                exchange        VARCHAR(16) NOT NULL,
                duplicate_index INT NOT NULL,
                is_active       BOOLEAN NOT NULL,
                start_date      DATE NOT NULL,
                end_date        DATE,
                created_at      TIMESTAMPTZ NOT NULL,
                updated_at      TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_symbol_listing
            ON canonical_symbol (ticker, exchange)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS symbology (
                mapping_id   BIGSERIAL PRIMARY KEY,
                source       VARCHAR(32) NOT NULL,
                source_id    VARCHAR(64) NOT NULL,
                tsid         VARCHAR(48) NOT NULL REFERENCES canonical_symbol(tsid),
                mapping_type VARCHAR(16) NOT NULL,
                valid_from   DATE NOT NULL,
                valid_until  DATE,
                created_at   TIMESTAMPTZ NOT NULL,
                updated_at   TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_symbology_active_pair
            ON symbology (source, source_id) WHERE valid_until IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_symbology_tsid ON symbology (tsid)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS observation (
                tsid       VARCHAR(48) NOT NULL,
                vendor     VARCHAR(32) NOT NULL,
                date       DATE NOT NULL,
                field      VARCHAR(16) NOT NULL,
                value      NUMERIC(20, 8) NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tsid, vendor, date, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS consensus_observation (
                tsid         VARCHAR(48) NOT NULL,
                date         DATE NOT NULL,
                field        VARCHAR(16) NOT NULL,
                value        NUMERIC(20, 8) NOT NULL,
                vendors      JSONB NOT NULL,
                total_weight INT NOT NULL,
                computed_at  TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tsid, date, field)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_symbol(row: &sqlx::postgres::PgRow) -> StoreResult<CanonicalSymbol> {
    let tsid: String = row.get("tsid");
    let tsid = tsid
        .parse::<Tsid>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;

    Ok(CanonicalSymbol {
        tsid,
        ticker: row.get("ticker"),
        exchange: row.get("exchange"),
        active: row.get("is_active"),
        start_date: row.get("start_date"),
        end_date: row.get("end_date"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_mapping(row: &sqlx::postgres::PgRow) -> StoreResult<SymbologyMapping> {
    let tsid: String = row.get("tsid");
    let tsid = tsid
        .parse::<Tsid>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let mapping_type: String = row.get("mapping_type");
    let mapping_type = MappingType::parse(&mapping_type)
        .ok_or_else(|| StoreError::InvalidData(format!("unknown mapping type '{mapping_type}'")))?;

    Ok(SymbologyMapping {
        source: row.get("source"),
        source_id: row.get("source_id"),
        tsid,
        mapping_type,
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_observation(row: &sqlx::postgres::PgRow) -> StoreResult<Observation> {
    let tsid: String = row.get("tsid");
    let tsid = tsid
        .parse::<Tsid>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let field: String = row.get("field");
    let field = Field::parse(&field)
        .ok_or_else(|| StoreError::InvalidData(format!("unknown field '{field}'")))?;

    Ok(Observation {
        tsid,
        vendor: row.get("vendor"),
        date: row.get("date"),
        field,
        value: row.get::<Decimal, _>("value"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_consensus(row: &sqlx::postgres::PgRow) -> StoreResult<ConsensusObservation> {
    let tsid: String = row.get("tsid");
    let tsid = tsid
        .parse::<Tsid>()
        .map_err(|e| StoreError::InvalidData(e.to_string()))?;
    let field: String = row.get("field");
    let field = Field::parse(&field)
        .ok_or_else(|| StoreError::InvalidData(format!("unknown field '{field}'")))?;
    let vendors: serde_json::Value = row.get("vendors");
    let vendors: Vec<String> =
        serde_json::from_value(vendors).map_err(|e| StoreError::InvalidData(e.to_string()))?;

    Ok(ConsensusObservation {
        tsid,
        date: row.get("date"),
        field,
        value: row.get::<Decimal, _>("value"),
        vendors,
        total_weight: row.get::<i32, _>("total_weight") as u32,
        computed_at: row.get("computed_at"),
    })
}

#[async_trait]
impl SymbologyStore for PgStore {
    async fn create_symbol(
        &self,
        symbol: &CanonicalSymbol,
        mapping: &SymbologyMapping,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO canonical_symbol (
                tsid, ticker, exchange, duplicate_index, is_active,
                start_date, end_date, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(symbol.tsid.to_string())
        .bind(&symbol.ticker)
        .bind(&symbol.exchange)
        .bind(symbol.tsid.duplicate_index() as i32)
        .bind(symbol.active)
        .bind(symbol.start_date)
        .bind(symbol.end_date)
        .bind(symbol.created_at)
        .bind(symbol.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO symbology (
                source, source_id, tsid, mapping_type,
                valid_from, valid_until, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&mapping.source)
        .bind(&mapping.source_id)
        .bind(mapping.tsid.to_string())
        .bind(mapping.mapping_type.as_str())
        .bind(mapping.valid_from)
        .bind(mapping.valid_until)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Created canonical symbol {}", symbol.tsid);
        Ok(())
    }

    async fn update_symbol(&self, symbol: &CanonicalSymbol) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE canonical_symbol
            SET ticker = $2, exchange = $3, is_active = $4,
                end_date = $5, updated_at = $6
            WHERE tsid = $1
            "#,
        )
        .bind(symbol.tsid.to_string())
        .bind(&symbol.ticker)
        .bind(&symbol.exchange)
        .bind(symbol.active)
        .bind(symbol.end_date)
        .bind(symbol.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidData(format!(
                "unknown canonical symbol {}",
                symbol.tsid
            )));
        }
        Ok(())
    }

    async fn symbol(&self, tsid: &Tsid) -> StoreResult<Option<CanonicalSymbol>> {
        let row = sqlx::query(
            r#"
            SELECT tsid, ticker, exchange, is_active, start_date, end_date,
                   created_at, updated_at
            FROM canonical_symbol
            WHERE tsid = $1
            "#,
        )
        .bind(tsid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_symbol).transpose()
    }

    async fn active_symbol_for_listing(
        &self,
        ticker: &str,
        exchange: &str,
    ) -> StoreResult<Option<CanonicalSymbol>> {
        let row = sqlx::query(
            r#"
            SELECT tsid, ticker, exchange, is_active, start_date, end_date,
                   created_at, updated_at
            FROM canonical_symbol
            WHERE ticker = $1 AND exchange = $2 AND is_active
            "#,
        )
        .bind(ticker)
        .bind(exchange)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_symbol).transpose()
    }

    async fn max_duplicate_index(&self, ticker: &str, exchange: &str) -> StoreResult<Option<u32>> {
        // Matches the frozen tsid portions, not the mutable listing fields
        let row = sqlx::query(
            r#"
            SELECT MAX(duplicate_index) AS max_index
            FROM canonical_symbol
            WHERE tsid LIKE $1 || '.' || $2 || '.%'
            "#,
        )
        .bind(ticker)
        .bind(exchange)
        .fetch_one(&self.pool)
        .await?;

        let max_index: Option<i32> = row.get("max_index");
        Ok(max_index.map(|i| i as u32))
    }

    async fn insert_mapping(&self, mapping: &SymbologyMapping) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO symbology (
                source, source_id, tsid, mapping_type,
                valid_from, valid_until, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&mapping.source)
        .bind(&mapping.source_id)
        .bind(mapping.tsid.to_string())
        .bind(mapping.mapping_type.as_str())
        .bind(mapping.valid_from)
        .bind(mapping.valid_until)
        .bind(mapping.created_at)
        .bind(mapping.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn close_mapping(
        &self,
        source: &str,
        source_id: &str,
        valid_until: NaiveDate,
        updated_at: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE symbology
            SET valid_until = $3, updated_at = $4
            WHERE source = $1 AND source_id = $2 AND valid_until IS NULL
            "#,
        )
        .bind(source)
        .bind(source_id)
        .bind(valid_until)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn mappings_for_source_id(
        &self,
        source: &str,
        source_id: &str,
    ) -> StoreResult<Vec<SymbologyMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT source, source_id, tsid, mapping_type,
                   valid_from, valid_until, created_at, updated_at
            FROM symbology
            WHERE source = $1 AND source_id = $2
            ORDER BY valid_from, mapping_id
            "#,
        )
        .bind(source)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mapping).collect()
    }

    async fn mappings_for_symbol(&self, tsid: &Tsid) -> StoreResult<Vec<SymbologyMapping>> {
        let rows = sqlx::query(
            r#"
            SELECT source, source_id, tsid, mapping_type,
                   valid_from, valid_until, created_at, updated_at
            FROM symbology
            WHERE tsid = $1
            ORDER BY source, valid_from, mapping_id
            "#,
        )
        .bind(tsid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_mapping).collect()
    }
}

#[async_trait]
impl ObservationStore for PgStore {
    async fn upsert_observation(&self, observation: &Observation) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO observation (tsid, vendor, date, field, value, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tsid, vendor, date, field) DO UPDATE
            SET value = $5, updated_at = $6
            "#,
        )
        .bind(observation.tsid.to_string())
        .bind(&observation.vendor)
        .bind(observation.date)
        .bind(observation.field.as_str())
        .bind(observation.value)
        .bind(observation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query_observations(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT tsid, vendor, date, field, value, updated_at
            FROM observation
            WHERE tsid = $1 AND field = $2
              AND ($3::date IS NULL OR date >= $3)
              AND ($4::date IS NULL OR date < $4)
            ORDER BY date ASC, vendor ASC
            "#,
        )
        .bind(tsid.to_string())
        .bind(field.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_observation).collect()
    }

    async fn observations_for_symbol(
        &self,
        tsid: &Tsid,
        cutoff: Option<NaiveDate>,
    ) -> StoreResult<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT tsid, vendor, date, field, value, updated_at
            FROM observation
            WHERE tsid = $1
              AND ($2::date IS NULL OR date > $2)
            ORDER BY date ASC, field ASC, vendor ASC
            "#,
        )
        .bind(tsid.to_string())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_observation).collect()
    }

    async fn upsert_consensus(&self, row: &ConsensusObservation) -> StoreResult<()> {
        let vendors = serde_json::to_value(&row.vendors)
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO consensus_observation (
                tsid, date, field, value, vendors, total_weight, computed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (tsid, date, field) DO UPDATE
            SET value = $4, vendors = $5, total_weight = $6, computed_at = $7
            "#,
        )
        .bind(row.tsid.to_string())
        .bind(row.date)
        .bind(row.field.as_str())
        .bind(row.value)
        .bind(vendors)
        .bind(row.total_weight as i32)
        .bind(row.computed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_consensus(&self, tsid: &Tsid, cutoff: Option<NaiveDate>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM consensus_observation
            WHERE tsid = $1
              AND ($2::date IS NULL OR date > $2)
            "#,
        )
        .bind(tsid.to_string())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn query_consensus(
        &self,
        tsid: &Tsid,
        field: Field,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> StoreResult<Vec<ConsensusObservation>> {
        let rows = sqlx::query(
            r#"
            SELECT tsid, date, field, value, vendors, total_weight, computed_at
            FROM consensus_observation
            WHERE tsid = $1 AND field = $2
              AND ($3::date IS NULL OR date >= $3)
              AND ($4::date IS NULL OR date < $4)
            ORDER BY date ASC
            "#,
        )
        .bind(tsid.to_string())
        .bind(field.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_consensus).collect()
    }
}
