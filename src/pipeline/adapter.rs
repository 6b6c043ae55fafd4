use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use super::pool::{PoolBounds, fan_out};
use crate::store::models::{AdapterFailure, FailureKind, Record};
use crate::util::{error::ServiceError, retry::RetryError};

/// What the orchestrator does when an adapter stage is unavailable for a whole batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the skipped check on every record and let later stages run.
    #[default]
    MarkAndContinue,
    /// Treat a batch whose every record hit the open circuit as a fatal run error.
    FailBatch,
}

impl FailurePolicy {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mark_and_continue" | "continue" => Some(Self::MarkAndContinue),
            "fail_batch" | "fail" => Some(Self::FailBatch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    pub bounds: PoolBounds,
    pub batch_size: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            bounds: PoolBounds::default(),
            batch_size: 200,
            failure_policy: FailurePolicy::MarkAndContinue,
        }
    }
}

/// Per-record adapter failure. Never fatal to the pipeline on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("{service} circuit open")]
    CircuitOpen { service: String },
    #[error("retries exhausted after {attempts} attempts: {message}")]
    Exhausted { attempts: usize, message: String },
    #[error("not found")]
    NotFound,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl AdapterError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Exhausted { .. } => FailureKind::RetriesExhausted,
            Self::NotFound => FailureKind::NotFound,
            Self::InvalidInput(_) => FailureKind::InvalidInput,
            Self::Rejected(_) => FailureKind::Rejected,
        }
    }
}

impl From<RetryError<ServiceError>> for AdapterError {
    fn from(error: RetryError<ServiceError>) -> Self {
        match error {
            RetryError::CircuitOpen { service } => Self::CircuitOpen { service },
            RetryError::Exhausted { attempts, source } => Self::Exhausted {
                attempts,
                message: source.to_string(),
            },
            RetryError::Rejected { source, .. } => match source {
                ServiceError::NotFound => Self::NotFound,
                ServiceError::InvalidInput(message) => Self::InvalidInput(message),
                other => Self::Rejected(other.to_string()),
            },
        }
    }
}

/// One record after an adapter stage, tagged with its position in the stage input.
#[derive(Debug, Clone)]
pub struct AdapterOutcome {
    pub position: usize,
    pub record: Record,
    pub result: Result<(), AdapterError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub adapter: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub circuit_open: usize,
    pub exhausted: usize,
}

impl BatchSummary {
    #[must_use]
    pub fn from_outcomes(adapter: &str, outcomes: &[AdapterOutcome]) -> Self {
        let mut summary = Self {
            adapter: adapter.to_string(),
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match &outcome.result {
                Ok(()) => summary.succeeded += 1,
                Err(error) => {
                    summary.failed += 1;
                    match error.kind() {
                        FailureKind::CircuitOpen => summary.circuit_open += 1,
                        FailureKind::RetriesExhausted => summary.exhausted += 1,
                        _ => {}
                    }
                }
            }
        }
        summary
    }

    /// Every record in the batch skipped the check, and the breaker was open for at least
    /// part of it.
    #[must_use]
    pub fn dependency_unavailable(&self) -> bool {
        self.total > 0
            && self.circuit_open > 0
            && self.circuit_open + self.exhausted == self.total
    }
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub outcomes: Vec<AdapterOutcome>,
    pub summary: BatchSummary,
    pub workers: usize,
}

impl BatchOutcome {
    /// Records in stage-input order.
    #[must_use]
    pub fn into_records(mut self) -> Vec<Record> {
        self.outcomes.sort_by_key(|outcome| outcome.position);
        self.outcomes.into_iter().map(|o| o.record).collect()
    }
}

/// Uniform contract for an enrichment or screening service.
///
/// Implementors provide `process_one`; `process_batch` sizes a pool from the adapter's
/// bounds, fans out, and folds every failure into the record it belongs to.
#[async_trait]
pub trait EnrichmentAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn settings(&self) -> AdapterSettings;

    async fn process_one(&self, record: &mut Record) -> Result<(), AdapterError>;

    async fn process_batch(&self, records: Vec<Record>) -> BatchOutcome {
        let started = Instant::now();
        let name = self.name();
        let settings = self.settings();
        let workers = settings.bounds.worker_count(records.len(), settings.batch_size);

        let outcomes = fan_out(records, workers, |position, mut record| async move {
            record.stages.push(name.to_string());
            let result = self.process_one(&mut record).await;
            if let Err(error) = &result {
                record.record_failure(AdapterFailure {
                    adapter: name.to_string(),
                    kind: error.kind(),
                    message: error.to_string(),
                });
            }
            AdapterOutcome {
                position,
                record,
                result,
            }
        })
        .await;

        let summary = BatchSummary::from_outcomes(name, &outcomes);
        info!(
            adapter = name,
            workers,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            circuit_open = summary.circuit_open,
            exhausted = summary.exhausted,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "adapter batch completed"
        );

        BatchOutcome {
            outcomes,
            summary,
            workers,
        }
    }
}
