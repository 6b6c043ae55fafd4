use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::models::{CandidateRow, ProcessingOutcome, Record};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse {operation} query failed")]
    Query {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("warehouse returned an undecodable row: {0}")]
    Decode(String),
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
}

/// One consolidated row written back to the cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub identity_key: String,
    pub litigator: bool,
    pub dnc: bool,
    pub outcome: ProcessingOutcome,
}

impl From<&Record> for CacheEntry {
    fn from(record: &Record) -> Self {
        Self {
            identity_key: record.identity_key.clone(),
            litigator: record.is_litigator(),
            dnc: record.is_dnc(),
            outcome: record.outcome(),
        }
    }
}

/// Warehouse capabilities the pipeline consumes: bounded extraction, cache lookup of
/// identity keys, and cache write-back.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn extract_candidates(&self, limit: usize) -> Result<Vec<CandidateRow>, WarehouseError>;

    /// Returns the subset of `keys` already screened successfully. Partial and failed
    /// entries are not returned, so a later run screens them again.
    async fn cached_keys(&self, keys: &[String]) -> Result<HashSet<String>, WarehouseError>;

    async fn write_cache(&self, job_id: Uuid, entries: &[CacheEntry]) -> Result<(), WarehouseError>;

    async fn ping(&self) -> Result<(), WarehouseError>;
}

/// Postgres-backed warehouse.
///
/// Table and column names come from validated configuration and are interpolated into
/// the SQL; all values are bound.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    source_table: String,
    id_column: String,
    cache_table: String,
}

impl PgWarehouse {
    #[must_use]
    pub fn new(
        pool: PgPool,
        source_table: impl Into<String>,
        id_column: impl Into<String>,
        cache_table: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            source_table: source_table.into(),
            id_column: id_column.into(),
            cache_table: cache_table.into(),
        }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn extract_candidates(&self, limit: usize) -> Result<Vec<CandidateRow>, WarehouseError> {
        let sql = format!(
            "SELECT {id}::text AS source_id, to_jsonb(t)::text AS payload \
             FROM {table} t ORDER BY {id} LIMIT $1",
            id = self.id_column,
            table = self.source_table,
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|source| WarehouseError::Query {
                operation: "extraction",
                source,
            })?;

        rows.into_iter()
            .map(|row| {
                let source_id: String = row
                    .try_get("source_id")
                    .map_err(|e| WarehouseError::Decode(e.to_string()))?;
                let payload: String = row
                    .try_get("payload")
                    .map_err(|e| WarehouseError::Decode(e.to_string()))?;
                let fields = serde_json::from_str(&payload)
                    .map_err(|e| WarehouseError::Decode(format!("row {source_id}: {e}")))?;
                Ok(CandidateRow::new(source_id, fields))
            })
            .collect()
    }

    async fn cached_keys(&self, keys: &[String]) -> Result<HashSet<String>, WarehouseError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }

        let sql = format!(
            "SELECT identity_key FROM {} WHERE identity_key = ANY($1) AND outcome = $2",
            self.cache_table
        );
        let rows = sqlx::query(&sql)
            .bind(keys)
            .bind(ProcessingOutcome::Success.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|source| WarehouseError::Query {
                operation: "cache lookup",
                source,
            })?;

        let found = rows
            .into_iter()
            .map(|row| row.try_get::<String, _>("identity_key"))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| WarehouseError::Decode(e.to_string()))?;
        debug!(requested = keys.len(), cached = found.len(), "cache lookup finished");
        Ok(found)
    }

    async fn write_cache(&self, job_id: Uuid, entries: &[CacheEntry]) -> Result<(), WarehouseError> {
        if entries.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = entries.iter().map(|e| e.identity_key.clone()).collect();
        let litigators: Vec<bool> = entries.iter().map(|e| e.litigator).collect();
        let dnc: Vec<bool> = entries.iter().map(|e| e.dnc).collect();
        let outcomes: Vec<String> = entries
            .iter()
            .map(|e| e.outcome.as_str().to_string())
            .collect();

        let sql = format!(
            r"
            INSERT INTO {} (identity_key, litigator, dnc, outcome, job_id, processed_at)
            SELECT key, lit, dnc, outcome, $5, NOW()
            FROM UNNEST($1::text[], $2::bool[], $3::bool[], $4::text[]) AS t(key, lit, dnc, outcome)
            ON CONFLICT (identity_key) DO UPDATE
            SET litigator = EXCLUDED.litigator,
                dnc = EXCLUDED.dnc,
                outcome = EXCLUDED.outcome,
                job_id = EXCLUDED.job_id,
                processed_at = EXCLUDED.processed_at
            ",
            self.cache_table
        );

        sqlx::query(&sql)
            .bind(&keys)
            .bind(&litigators)
            .bind(&dnc)
            .bind(&outcomes)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|source| WarehouseError::Query {
                operation: "cache write",
                source,
            })?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), WarehouseError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|source| WarehouseError::Query {
                operation: "ping",
                source,
            })
    }
}
