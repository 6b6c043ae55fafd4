use crate::store::models::{JobCounters, ProcessingOutcome, Record};

use super::adapter::BatchSummary;

/// A fully screened batch, records back in extraction order.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub index: usize,
    pub records: Vec<Record>,
    pub summaries: Vec<BatchSummary>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub processed: usize,
    pub litigator: usize,
    pub dnc: usize,
    pub clean: usize,
    pub partial: usize,
    pub failed: usize,
}

impl BatchTally {
    pub fn apply_to(&self, counters: &mut JobCounters) {
        counters.total_processed += self.processed;
        counters.litigator_count += self.litigator;
        counters.dnc_count += self.dnc;
        counters.clean_count += self.clean;
        counters.partial_count += self.partial;
        counters.failed_count += self.failed;
    }
}

impl BatchResult {
    #[must_use]
    pub fn new(index: usize, records: Vec<Record>, summaries: Vec<BatchSummary>) -> Self {
        Self {
            index,
            records,
            summaries,
        }
    }

    #[must_use]
    pub fn tally(&self) -> BatchTally {
        self.records
            .iter()
            .fold(BatchTally::default(), |mut tally, record| {
                tally.processed += 1;
                if record.is_litigator() {
                    tally.litigator += 1;
                }
                if record.is_dnc() {
                    tally.dnc += 1;
                }
                if record.is_clean() {
                    tally.clean += 1;
                }
                match record.outcome() {
                    ProcessingOutcome::Success => {}
                    ProcessingOutcome::Partial => tally.partial += 1,
                    ProcessingOutcome::Failed => tally.failed += 1,
                }
                tally
            })
    }
}
