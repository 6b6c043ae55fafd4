use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::JobContext;
use crate::store::{
    models::Record,
    warehouse::{CacheEntry, Warehouse},
};

use super::aggregate::BatchResult;

/// One spreadsheet row per screened record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SheetRow {
    pub identity_key: String,
    pub name: String,
    pub phones: String,
    pub emails: String,
    pub litigator: bool,
    pub dnc_phones: String,
    pub outcome: String,
    pub notes: String,
}

impl SheetRow {
    pub const HEADER: [&'static str; 8] = [
        "identity_key",
        "name",
        "phones",
        "emails",
        "litigator",
        "dnc_phones",
        "outcome",
        "notes",
    ];

    #[must_use]
    pub fn values(&self) -> Vec<String> {
        vec![
            self.identity_key.clone(),
            self.name.clone(),
            self.phones.clone(),
            self.emails.clone(),
            self.litigator.to_string(),
            self.dnc_phones.clone(),
            self.outcome.clone(),
            self.notes.clone(),
        ]
    }
}

impl From<&Record> for SheetRow {
    fn from(record: &Record) -> Self {
        Self {
            identity_key: record.identity_key.clone(),
            name: record.display_name(),
            phones: record
                .phones
                .iter()
                .map(|p| p.number.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            emails: record.emails.join(", "),
            litigator: record.is_litigator(),
            dnc_phones: record.dnc_phones().join(", "),
            outcome: record.outcome().as_str().to_string(),
            notes: record
                .failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; "),
        }
    }
}

/// Destination spreadsheet. Implementations retry internally; an error returned here is
/// final for the batch.
#[async_trait]
pub trait SpreadsheetSink: Send + Sync {
    async fn append_rows(&self, job_id: Uuid, batch: usize, rows: &[SheetRow])
    -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub rows_appended: usize,
    pub cache_entries: usize,
    pub cache_error: Option<String>,
}

#[async_trait]
pub trait PublishStage: Send + Sync {
    async fn publish(&self, job: &JobContext, batch: &BatchResult)
    -> anyhow::Result<PublishReport>;
}

/// Appends the batch to the spreadsheet, then writes it back to the warehouse cache.
pub struct SheetAndCachePublishStage {
    sheet: Arc<dyn SpreadsheetSink>,
    warehouse: Arc<dyn Warehouse>,
}

impl SheetAndCachePublishStage {
    #[must_use]
    pub fn new(sheet: Arc<dyn SpreadsheetSink>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { sheet, warehouse }
    }
}

#[async_trait]
impl PublishStage for SheetAndCachePublishStage {
    async fn publish(
        &self,
        job: &JobContext,
        batch: &BatchResult,
    ) -> anyhow::Result<PublishReport> {
        if batch.records.is_empty() {
            return Ok(PublishReport::default());
        }

        let rows: Vec<SheetRow> = batch.records.iter().map(SheetRow::from).collect();
        self.sheet
            .append_rows(job.job_id, batch.index + 1, &rows)
            .await?;

        let entries: Vec<CacheEntry> = batch.records.iter().map(CacheEntry::from).collect();
        let cache_error = match self.warehouse.write_cache(job.job_id, &entries).await {
            Ok(()) => None,
            Err(error) => {
                warn!(
                    job_id = %job.job_id,
                    batch = batch.index + 1,
                    error = %error,
                    "cache write-back failed; records may be reprocessed by a later run"
                );
                Some(error.to_string())
            }
        };

        info!(
            job_id = %job.job_id,
            batch = batch.index + 1,
            rows = rows.len(),
            cache_written = cache_error.is_none(),
            "batch published"
        );

        Ok(PublishReport {
            rows_appended: rows.len(),
            cache_entries: if cache_error.is_none() { entries.len() } else { 0 },
            cache_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::store::{
        memory::InMemoryWarehouse,
        models::{AdapterFailure, CandidateRow, FailureKind, PhoneNumber},
    };

    #[derive(Default)]
    struct CollectingSheet {
        rows: Mutex<Vec<SheetRow>>,
    }

    #[async_trait]
    impl SpreadsheetSink for CollectingSheet {
        async fn append_rows(
            &self,
            _job_id: Uuid,
            _batch: usize,
            rows: &[SheetRow],
        ) -> anyhow::Result<()> {
            self.rows.lock().expect("lock").extend_from_slice(rows);
            Ok(())
        }
    }

    struct BrokenSheet;

    #[async_trait]
    impl SpreadsheetSink for BrokenSheet {
        async fn append_rows(
            &self,
            _job_id: Uuid,
            _batch: usize,
            _rows: &[SheetRow],
        ) -> anyhow::Result<()> {
            anyhow::bail!("spreadsheet unreachable")
        }
    }

    fn screened_record() -> Record {
        let fields = json!({"first_name": "Ada", "last_name": "Lovelace"});
        let mut record = Record::from_row(CandidateRow::new(
            "7",
            fields.as_object().cloned().unwrap_or_default(),
        ));
        record.stages = vec!["person_lookup".into(), "dnc_screening".into()];
        record.phones = vec![
            PhoneNumber {
                number: "2025550101".into(),
                dnc: Some(true),
            },
            PhoneNumber {
                number: "2025550102".into(),
                dnc: Some(false),
            },
        ];
        record.emails = vec!["ada@example.com".into()];
        record
    }

    #[test]
    fn sheet_row_flattens_record() {
        let mut record = screened_record();
        record.record_failure(AdapterFailure {
            adapter: "litigator_screening".into(),
            kind: FailureKind::RetriesExhausted,
            message: "timeout".into(),
        });

        let row = SheetRow::from(&record);
        assert_eq!(row.name, "Ada Lovelace");
        assert_eq!(row.phones, "2025550101, 2025550102");
        assert_eq!(row.dnc_phones, "2025550101");
        assert_eq!(row.outcome, "partial");
        assert_eq!(row.notes, "litigator_screening check skipped (timeout)");
        assert_eq!(row.values().len(), SheetRow::HEADER.len());
    }

    #[tokio::test]
    async fn cache_write_failure_is_reported_not_raised() {
        let sheet = Arc::new(CollectingSheet::default());
        let warehouse = Arc::new(InMemoryWarehouse::default());
        warehouse.fail_cache_writes(true);
        let stage = SheetAndCachePublishStage::new(sheet.clone(), warehouse.clone());

        let batch = BatchResult::new(0, vec![screened_record()], Vec::new());
        let report = stage
            .publish(&JobContext::new(10), &batch)
            .await
            .expect("sheet append succeeded");

        assert_eq!(report.rows_appended, 1);
        assert_eq!(report.cache_entries, 0);
        assert!(report.cache_error.is_some());
        assert_eq!(sheet.rows.lock().expect("lock").len(), 1);
        assert_eq!(warehouse.cache_len(), 0);
    }

    #[tokio::test]
    async fn sheet_failure_is_fatal_and_skips_cache() {
        let warehouse = Arc::new(InMemoryWarehouse::default());
        let stage = SheetAndCachePublishStage::new(Arc::new(BrokenSheet), warehouse.clone());

        let batch = BatchResult::new(0, vec![screened_record()], Vec::new());
        let error = stage
            .publish(&JobContext::new(10), &batch)
            .await
            .expect_err("sheet append fails");

        assert!(error.to_string().contains("unreachable"));
        assert_eq!(warehouse.cache_len(), 0);
    }
}
