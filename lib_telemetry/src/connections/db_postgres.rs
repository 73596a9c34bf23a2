//! # PostgreSQL Telemetry Store
//!
//! A [`TelemetryStore`] backed by a `deadpool_postgres` connection pool.
//!
//! Each transaction owns one pooled connection for its whole life and drives
//! `BEGIN` / `COMMIT` / `ROLLBACK` explicitly. Every chunk is one multi-row
//! parameterized `INSERT`.

use async_trait::async_trait;
use deadpool_postgres::{Config as DeadpoolConfig, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use crate::core::persistence::{StoreTransaction, TelemetryStore};
use crate::error::StoreError;
use crate::models::StorageRow;

/// Target table.
pub const TABLE: &str = "flight_state_vectors";

const COLUMNS: [&str; 10] = [
    "icao24",
    "callsign",
    "origin_country",
    "lat",
    "lon",
    "velocity",
    "time_position",
    "baro_altitude",
    "geo_altitude",
    "last_contact",
];

/// Most rows a single INSERT can carry: the protocol caps bind parameters at `u16::MAX`.
pub const MAX_CHUNK_ROWS: usize = u16::MAX as usize / COLUMNS.len();

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flight_state_vectors (
    id             BIGSERIAL PRIMARY KEY,
    icao24         TEXT             NOT NULL,
    callsign       TEXT             NOT NULL DEFAULT '',
    origin_country TEXT             NOT NULL,
    lat            DOUBLE PRECISION NOT NULL,
    lon            DOUBLE PRECISION NOT NULL,
    velocity       DOUBLE PRECISION NOT NULL,
    time_position  TIMESTAMPTZ      NOT NULL,
    baro_altitude  DOUBLE PRECISION NOT NULL,
    geo_altitude   DOUBLE PRECISION NOT NULL,
    last_contact   TIMESTAMPTZ      NOT NULL
);
CREATE INDEX IF NOT EXISTS flight_state_vectors_icao24_last_contact_idx
    ON flight_state_vectors (icao24, last_contact DESC);
";

/// # Postgres Store
#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Builds the pool, checks connectivity and creates the table if needed.
    pub async fn connect(database_url: &str, max_connections: usize) -> Result<Self, StoreError> {
        let mut pg_pool_config = DeadpoolConfig::new();
        pg_pool_config.url = Some(database_url.to_string());
        pg_pool_config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        pg_pool_config.pool = Some(deadpool_postgres::PoolConfig::new(max_connections.max(1)));

        let pool = pg_pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable(format!("failed to create pool: {}", e)))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        log::info!("PostgreSQL store ready (table '{}')", TABLE);
        Ok(store)
    }

    /// Idempotent `CREATE TABLE IF NOT EXISTS`.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| StoreError::Unavailable(format!("schema setup failed: {}", e)))
    }

    async fn client(&self) -> Result<Object, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(format!("pool: {}", e)))
    }
}

#[async_trait]
impl TelemetryStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| StoreError::Transaction(format!("BEGIN: {}", e)))?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
            written: 0,
        }))
    }
}

struct PostgresTransaction {
    // `None` once committed or rolled back.
    client: Option<Object>,
    written: usize,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Object, StoreError> {
        self.client
            .as_ref()
            .ok_or_else(|| StoreError::Transaction("transaction already finished".into()))
    }

    async fn finish(mut self: Box<Self>, statement: &'static str) -> Result<(), StoreError> {
        let client = self.client.take().ok_or_else(|| {
            StoreError::Transaction("transaction already finished".into())
        })?;
        client
            .batch_execute(statement)
            .await
            .map_err(|e| StoreError::Transaction(format!("{}: {}", statement, e)))
    }
}

// A transaction abandoned mid-flight (task cancelled) must not return its
// connection to the pool with the transaction still open.
impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = client.batch_execute("ROLLBACK").await {
                        log::warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn insert_chunk(&mut self, rows: &[StorageRow]) -> Result<(), StoreError> {
        for part in rows.chunks(MAX_CHUNK_ROWS) {
            self.insert_rows(part).await?;
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.finish("ROLLBACK").await
    }
}

impl PostgresTransaction {
    async fn insert_rows(&mut self, rows: &[StorageRow]) -> Result<(), StoreError> {
        let sql = insert_statement(rows.len());
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(rows.len() * COLUMNS.len());
        for row in rows {
            params.push(&row.icao24);
            params.push(&row.callsign);
            params.push(&row.origin_country);
            params.push(&row.latitude);
            params.push(&row.longitude);
            params.push(&row.velocity);
            params.push(&row.time_position);
            params.push(&row.baro_altitude);
            params.push(&row.geo_altitude);
            params.push(&row.last_contact);
        }

        self.client()?
            .execute(sql.as_str(), &params)
            .await
            .map_err(|e| StoreError::ChunkFailed {
                offset: self.written,
                reason: e.to_string(),
            })?;
        self.written += rows.len();
        Ok(())
    }
}

/// `INSERT INTO flight_state_vectors (...) VALUES ($1, ..., $10), ($11, ...)`
fn insert_statement(rows: usize) -> String {
    let width = COLUMNS.len();
    let values: Vec<String> = (0..rows)
        .map(|r| {
            let placeholders: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        TABLE,
        COLUMNS.join(", "),
        values.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_row_statement() {
        assert_eq!(
            insert_statement(1),
            "INSERT INTO flight_state_vectors (icao24, callsign, origin_country, lat, lon, velocity, \
             time_position, baro_altitude, geo_altitude, last_contact) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
    }

    #[test]
    fn placeholders_continue_across_rows() {
        let sql = insert_statement(3);
        assert!(sql.contains("($11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"));
        assert!(sql.ends_with("$30)"));
        assert_eq!(sql.matches('(').count(), 4);
    }

    #[test]
    fn largest_chunk_stays_within_the_parameter_limit() {
        assert_eq!(MAX_CHUNK_ROWS, 6553);
        let sql = insert_statement(MAX_CHUNK_ROWS);
        assert!(sql.ends_with("$65530)"));
        assert!(MAX_CHUNK_ROWS * COLUMNS.len() <= usize::from(u16::MAX));
    }

    #[test]
    fn schema_matches_insert_columns() {
        for column in COLUMNS {
            assert!(SCHEMA.contains(column), "schema misses {}", column);
        }
    }
}
