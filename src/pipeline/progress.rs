//! Progress events and the per-job broadcast bus that carries them to observers.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::store::models::{JobCounters, ProcessingOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressPayload {
    StageStarted {
        stage: String,
        batch: Option<usize>,
    },
    BatchProgress {
        percent: u8,
        current_batch: usize,
        total_batches: usize,
        current_row: usize,
        total_rows: usize,
        counters: JobCounters,
    },
    RowProcessed {
        row: usize,
        total_rows: usize,
        identity_key: String,
        outcome: ProcessingOutcome,
        litigator: bool,
        dnc: bool,
    },
    JobCompleted {
        counters: JobCounters,
        notes: Vec<String>,
    },
    JobFailed {
        error: String,
        counters: JobCounters,
    },
    JobCancelled {
        counters: JobCounters,
    },
}

impl ProgressPayload {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::StageStarted { .. } => "stage_started",
            Self::BatchProgress { .. } => "batch_progress",
            Self::RowProcessed { .. } => "row_processed",
            Self::JobCompleted { .. } => "job_completed",
            Self::JobFailed { .. } => "job_failed",
            Self::JobCancelled { .. } => "job_cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: ProgressPayload,
}

impl ProgressEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// The only capability the orchestrator needs from the observer side.
pub trait ProgressPublisher: Send + Sync {
    fn publish(&self, event: ProgressEvent);

    /// Called once after a job's terminal event.
    fn close(&self, _job_id: Uuid) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl ProgressPublisher for NoopPublisher {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Stamps ordering and timestamps for one job's events.
pub struct EventEmitter {
    job_id: Uuid,
    next_sequence: u64,
    publisher: Arc<dyn ProgressPublisher>,
}

impl EventEmitter {
    #[must_use]
    pub fn new(job_id: Uuid, publisher: Arc<dyn ProgressPublisher>) -> Self {
        Self {
            job_id,
            next_sequence: 0,
            publisher,
        }
    }

    pub fn emit(&mut self, payload: ProgressPayload) {
        let event = ProgressEvent {
            job_id: self.job_id,
            sequence: self.next_sequence,
            emitted_at: Utc::now(),
            payload,
        };
        self.next_sequence += 1;
        self.publisher.publish(event);
    }

    pub fn close(&self) {
        self.publisher.close(self.job_id);
    }
}

/// Broadcast channels keyed by job id.
///
/// Subscribing before the job starts (or while it runs) yields every later event in
/// order. A slow subscriber that falls more than `capacity` events behind loses the
/// oldest ones and sees a lag notification from the receiver.
pub struct ProgressBus {
    capacity: usize,
    channels: RwLock<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.sender(job_id).subscribe()
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn sender(&self, job_id: Uuid) -> broadcast::Sender<ProgressEvent> {
        if let Some(sender) = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&job_id)
        {
            return sender.clone();
        }

        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl ProgressPublisher for ProgressBus {
    fn publish(&self, event: ProgressEvent) {
        let job_id = event.job_id;
        let event_type = event.event_type();
        match self.sender(job_id).send(event) {
            Ok(receivers) => debug!(%job_id, event_type, receivers, "progress event published"),
            Err(_) => debug!(%job_id, event_type, "progress event published with no subscribers"),
        }
    }

    fn close(&self, job_id: Uuid) {
        // Dropping the last sender lets subscribers drain buffered events and then end.
        self.channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&job_id);
    }
}
