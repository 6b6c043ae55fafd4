use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Fields that identify a person when the warehouse row carries no stable key.
const IDENTITY_FIELDS: [&str; 4] = ["first_name", "last_name", "address", "zip"];

/// A raw row as returned by the warehouse extraction query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRow {
    pub source_id: String,
    pub fields: Map<String, Value>,
}

impl CandidateRow {
    #[must_use]
    pub fn new(source_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            source_id: source_id.into(),
            fields,
        }
    }

    /// Stable identity key: a hash over the normalized name/address fields, falling back
    /// to the warehouse id when none of them are present.
    #[must_use]
    pub fn identity_key(&self) -> String {
        let parts: Vec<String> = IDENTITY_FIELDS
            .iter()
            .map(|name| normalize_component(self.fields.get(*name)))
            .collect();

        if parts.iter().all(String::is_empty) {
            return format!("src:{}", self.source_id);
        }

        format!("id:{:016x}", xxh3_64(parts.join("|").as_bytes()))
    }
}

fn normalize_component(value: Option<&Value>) -> String {
    let raw = match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return String::new(),
    };
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneNumber {
    pub number: String,
    /// `None` until the DNC stage has screened this number.
    pub dnc: Option<bool>,
}

impl PhoneNumber {
    #[must_use]
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            dnc: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CircuitOpen,
    RetriesExhausted,
    NotFound,
    InvalidInput,
    Rejected,
}

impl FailureKind {
    /// The dependency was unavailable, so the check was skipped rather than answered.
    #[must_use]
    pub const fn is_skip(self) -> bool {
        matches!(self, Self::CircuitOpen | Self::RetriesExhausted)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RetriesExhausted => "retries_exhausted",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterFailure {
    pub adapter: String,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_skip() {
            write!(f, "{} check skipped ({})", self.adapter, self.message)
        } else {
            write!(f, "{}: {}", self.adapter, self.message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Success,
    Partial,
    Failed,
}

impl ProcessingOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// One candidate flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identity_key: String,
    pub source_id: String,
    pub fields: Map<String, Value>,
    pub phones: Vec<PhoneNumber>,
    pub emails: Vec<String>,
    /// `None` until the litigator stage has answered for this record.
    pub litigator: Option<bool>,
    /// Adapter names that ran against this record, in order.
    pub stages: Vec<String>,
    pub failures: Vec<AdapterFailure>,
}

impl Record {
    #[must_use]
    pub fn from_row(row: CandidateRow) -> Self {
        Self {
            identity_key: row.identity_key(),
            source_id: row.source_id,
            fields: row.fields,
            phones: Vec::new(),
            emails: Vec::new(),
            litigator: None,
            stages: Vec::new(),
            failures: Vec::new(),
        }
    }

    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        [self.field_str("first_name"), self.field_str("last_name")]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[must_use]
    pub fn is_litigator(&self) -> bool {
        self.litigator == Some(true)
    }

    #[must_use]
    pub fn is_dnc(&self) -> bool {
        self.phones.iter().any(|p| p.dnc == Some(true))
    }

    #[must_use]
    pub fn dnc_phones(&self) -> Vec<&str> {
        self.phones
            .iter()
            .filter(|p| p.dnc == Some(true))
            .map(|p| p.number.as_str())
            .collect()
    }

    pub fn record_failure(&mut self, failure: AdapterFailure) {
        self.failures.push(failure);
    }

    #[must_use]
    pub fn failure_for(&self, adapter: &str) -> Option<&AdapterFailure> {
        self.failures.iter().find(|f| f.adapter == adapter)
    }

    #[must_use]
    pub fn outcome(&self) -> ProcessingOutcome {
        if self.failures.is_empty() {
            ProcessingOutcome::Success
        } else if self.failures.len() >= self.stages.len() {
            ProcessingOutcome::Failed
        } else {
            ProcessingOutcome::Partial
        }
    }

    /// Fully screened, answered by every stage, and flagged by none.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.outcome() == ProcessingOutcome::Success && !self.is_litigator() && !self.is_dnc()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub extracted: usize,
    pub skipped: usize,
    pub total_processed: usize,
    pub litigator_count: usize,
    pub dnc_count: usize,
    pub clean_count: usize,
    pub partial_count: usize,
    pub failed_count: usize,
}

/// Snapshot of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub current_stage: Option<String>,
    pub current_batch: usize,
    pub total_batches: usize,
    pub current_row: usize,
    pub total_rows: usize,
    pub limit: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub counters: JobCounters,
    pub notes: Vec<String>,
}

impl Job {
    #[must_use]
    pub fn new(id: Uuid, limit: usize) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            progress_percent: 0,
            current_stage: None,
            current_batch: 0,
            total_batches: 0,
            current_row: 0,
            total_rows: 0,
            limit,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            message: None,
            counters: JobCounters::default(),
            notes: Vec::new(),
        }
    }

    /// PENDING -> RUNNING. Returns `false` when the job already left PENDING.
    pub fn start(&mut self) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Moves the job into a terminal state. Terminal states are absorbing, so a second
    /// call is ignored and returns `false`.
    pub fn finish(&mut self, status: JobStatus, message: impl Into<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.message = Some(message.into());
        self.completed_at = Some(Utc::now());
        if status == JobStatus::Completed {
            self.progress_percent = 100;
        }
        self.current_stage = None;
        true
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !self.notes.contains(&note) {
            self.notes.push(note);
        }
    }
}
