use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::scheduler::JobContext;
use crate::store::{models::Record, warehouse::Warehouse};

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredCandidates {
    pub records: Vec<Record>,
    pub skipped: usize,
    /// Set when the cache could not be consulted and nothing was filtered.
    pub degraded: Option<String>,
}

#[async_trait]
pub trait DedupStage: Send + Sync {
    async fn filter(&self, job: &JobContext, records: Vec<Record>) -> FilteredCandidates;
}

/// Drops records whose identity key is already in the warehouse cache.
///
/// Lookups are chunked to keep each query bounded. The filter is an optimization:
/// when a lookup fails every record is kept, because reprocessing is idempotent.
pub struct CacheDedupStage {
    warehouse: Arc<dyn Warehouse>,
    chunk_size: usize,
}

impl CacheDedupStage {
    #[must_use]
    pub fn new(warehouse: Arc<dyn Warehouse>, chunk_size: usize) -> Self {
        Self {
            warehouse,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl DedupStage for CacheDedupStage {
    async fn filter(&self, job: &JobContext, records: Vec<Record>) -> FilteredCandidates {
        let keys: Vec<String> = records.iter().map(|r| r.identity_key.clone()).collect();
        let mut cached = std::collections::HashSet::new();

        for chunk in keys.chunks(self.chunk_size) {
            match self.warehouse.cached_keys(chunk).await {
                Ok(found) => cached.extend(found),
                Err(error) => {
                    warn!(
                        job_id = %job.job_id,
                        error = %error,
                        "cache lookup failed, processing every candidate"
                    );
                    return FilteredCandidates {
                        records,
                        skipped: 0,
                        degraded: Some(format!("cache lookup unavailable: {error}")),
                    };
                }
            }
        }

        let total = records.len();
        let records: Vec<Record> = records
            .into_iter()
            .filter(|r| !cached.contains(&r.identity_key))
            .collect();
        let skipped = total - records.len();

        info!(
            job_id = %job.job_id,
            candidates = total,
            skipped,
            remaining = records.len(),
            "cache filter applied"
        );

        FilteredCandidates {
            records,
            skipped,
            degraded: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;
    use crate::store::{memory::InMemoryWarehouse, models::CandidateRow};

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record::from_row(CandidateRow::new(i.to_string(), Map::new())))
            .collect()
    }

    #[tokio::test]
    async fn removes_cached_identities_in_chunks() {
        let warehouse = Arc::new(InMemoryWarehouse::default());
        warehouse.seed_cache(["src:1", "src:4", "src:8"]);
        let stage = CacheDedupStage::new(warehouse.clone(), 3);

        let filtered = stage.filter(&JobContext::new(10), records(10)).await;

        assert_eq!(filtered.skipped, 3);
        assert_eq!(filtered.records.len(), 7);
        assert!(filtered.records.iter().all(|r| !["1", "4", "8"].contains(&r.source_id.as_str())));
        assert_eq!(warehouse.lookup_count(), 4);
    }

    #[tokio::test]
    async fn filtering_twice_without_writes_is_idempotent() {
        let warehouse = Arc::new(InMemoryWarehouse::default());
        warehouse.seed_cache(["src:2"]);
        let stage = CacheDedupStage::new(warehouse, 100);
        let job = JobContext::new(10);

        let first = stage.filter(&job, records(5)).await;
        let second = stage.filter(&job, records(5)).await;

        assert_eq!(first, second);
    }
}
