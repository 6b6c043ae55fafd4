//! In-process warehouse used by dry runs and tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    models::{CandidateRow, ProcessingOutcome},
    warehouse::{CacheEntry, Warehouse, WarehouseError},
};

#[derive(Debug, Default)]
pub struct InMemoryWarehouse {
    rows: Mutex<Vec<CandidateRow>>,
    cache: Mutex<HashMap<String, (Uuid, CacheEntry)>>,
    fail_extraction: AtomicBool,
    fail_cache_writes: AtomicBool,
    fail_pings: AtomicBool,
    lookups: AtomicUsize,
}

impl InMemoryWarehouse {
    #[must_use]
    pub fn with_rows(rows: Vec<CandidateRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    /// Marks identity keys as already processed by an earlier run.
    pub fn seed_cache<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cache = lock(&self.cache);
        for key in keys {
            let key = key.into();
            cache.insert(
                key.clone(),
                (
                    Uuid::nil(),
                    CacheEntry {
                        identity_key: key,
                        litigator: false,
                        dnc: false,
                        outcome: ProcessingOutcome::Success,
                    },
                ),
            );
        }
    }

    pub fn fail_extraction(&self, fail: bool) {
        self.fail_extraction.store(fail, Ordering::SeqCst);
    }

    pub fn fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cache_writes(&self, fail: bool) {
        self.fail_cache_writes.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn cached_entry(&self, key: &str) -> Option<CacheEntry> {
        lock(&self.cache).get(key).map(|(_, entry)| entry.clone())
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        lock(&self.cache).len()
    }

    /// Number of cache lookup queries issued so far.
    #[must_use]
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn extract_candidates(&self, limit: usize) -> Result<Vec<CandidateRow>, WarehouseError> {
        if self.fail_extraction.load(Ordering::SeqCst) {
            return Err(WarehouseError::Unavailable(
                "extraction query refused".to_string(),
            ));
        }
        Ok(lock(&self.rows).iter().take(limit).cloned().collect())
    }

    async fn cached_keys(&self, keys: &[String]) -> Result<HashSet<String>, WarehouseError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let cache = lock(&self.cache);
        Ok(keys
            .iter()
            .filter(|key| {
                cache
                    .get(*key)
                    .is_some_and(|(_, entry)| entry.outcome == ProcessingOutcome::Success)
            })
            .cloned()
            .collect())
    }

    async fn write_cache(&self, job_id: Uuid, entries: &[CacheEntry]) -> Result<(), WarehouseError> {
        if self.fail_cache_writes.load(Ordering::SeqCst) {
            return Err(WarehouseError::Unavailable("cache table locked".to_string()));
        }
        let mut cache = lock(&self.cache);
        for entry in entries {
            cache.insert(entry.identity_key.clone(), (job_id, entry.clone()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), WarehouseError> {
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(WarehouseError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    #[tokio::test]
    async fn extraction_honours_limit_and_order() {
        let rows = (0..5)
            .map(|i| CandidateRow::new(i.to_string(), Map::new()))
            .collect();
        let warehouse = InMemoryWarehouse::with_rows(rows);

        let extracted = warehouse.extract_candidates(3).await.expect("extract");
        let ids: Vec<_> = extracted.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn cache_round_trip() {
        let warehouse = InMemoryWarehouse::default();
        warehouse.seed_cache(["a"]);

        let found = warehouse
            .cached_keys(&["a".to_string(), "b".to_string()])
            .await
            .expect("lookup");
        assert_eq!(found, HashSet::from(["a".to_string()]));
        assert_eq!(warehouse.lookup_count(), 1);
    }

    #[tokio::test]
    async fn partial_entries_are_not_reported_as_cached() {
        let warehouse = InMemoryWarehouse::default();
        let entry = |key: &str, outcome| CacheEntry {
            identity_key: key.to_string(),
            litigator: false,
            dnc: false,
            outcome,
        };
        warehouse
            .write_cache(
                Uuid::now_v7(),
                &[
                    entry("screened", ProcessingOutcome::Success),
                    entry("dnc-skipped", ProcessingOutcome::Partial),
                    entry("lookup-failed", ProcessingOutcome::Failed),
                ],
            )
            .await
            .expect("write");

        let keys = ["screened", "dnc-skipped", "lookup-failed"].map(String::from);
        let found = warehouse.cached_keys(&keys).await.expect("lookup");

        assert_eq!(found, HashSet::from(["screened".to_string()]));
        assert_eq!(warehouse.cache_len(), 3);
    }
}
