use std::{collections::HashSet, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::scheduler::JobContext;
use crate::store::{models::Record, warehouse::Warehouse};

/// Records pulled from the warehouse, in extraction order, with in-run duplicates
/// collapsed to their first occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedCandidates {
    pub rows_extracted: usize,
    pub duplicates: usize,
    pub records: Vec<Record>,
}

#[async_trait]
pub trait ExtractStage: Send + Sync {
    async fn extract(&self, job: &JobContext) -> anyhow::Result<ExtractedCandidates>;
}

pub struct WarehouseExtractStage {
    warehouse: Arc<dyn Warehouse>,
}

impl WarehouseExtractStage {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }
}

#[async_trait]
impl ExtractStage for WarehouseExtractStage {
    async fn extract(&self, job: &JobContext) -> anyhow::Result<ExtractedCandidates> {
        let rows = self
            .warehouse
            .extract_candidates(job.limit)
            .await
            .context("warehouse extraction query failed")?;
        let rows_extracted = rows.len();

        let mut seen = HashSet::with_capacity(rows_extracted);
        let mut records = Vec::with_capacity(rows_extracted);
        for row in rows {
            let record = Record::from_row(row);
            if seen.insert(record.identity_key.clone()) {
                records.push(record);
            } else {
                debug!(
                    job_id = %job.job_id,
                    identity_key = %record.identity_key,
                    source_id = %record.source_id,
                    "duplicate identity within extraction"
                );
            }
        }

        let duplicates = rows_extracted - records.len();
        info!(
            job_id = %job.job_id,
            rows_extracted,
            duplicates,
            limit = job.limit,
            "extraction completed"
        );

        Ok(ExtractedCandidates {
            rows_extracted,
            duplicates,
            records,
        })
    }
}
