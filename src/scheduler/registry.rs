//! In-process job snapshots and cancellation tokens.

use std::{
    collections::{HashMap, VecDeque},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::store::models::{Job, JobStatus};

use super::jobs::JobContext;

const DEFAULT_HISTORY_LIMIT: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Requested(Job),
    AlreadyTerminal(Job),
    NotFound,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Jobs {
    entries: HashMap<Uuid, Entry>,
    /// Terminal job ids, oldest first.
    finished: VecDeque<Uuid>,
}

impl Jobs {
    fn mark_finished(&mut self, job_id: Uuid, history_limit: usize) {
        self.finished.push_back(job_id);
        while self.finished.len() > history_limit {
            if let Some(evicted) = self.finished.pop_front() {
                self.entries.remove(&evicted);
                debug!(job_id = %evicted, "evicted finished job snapshot");
            }
        }
    }
}

/// Readers get cloned snapshots. The orchestrator run that owns a job is its only writer.
///
/// Live jobs are always kept; only the most recent `history_limit` terminal snapshots
/// are retained.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<Jobs>,
    history_limit: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            jobs: RwLock::new(Jobs::default()),
            history_limit: history_limit.max(1),
        }
    }

    /// Creates a PENDING job and the context its run will carry.
    pub fn register(&self, limit: usize) -> (Job, JobContext) {
        let context = JobContext::new(limit);
        let job = Job::new(context.job_id, limit);
        self.write().entries.insert(
            job.id,
            Entry {
                job: job.clone(),
                cancel: context.cancel.clone(),
            },
        );
        (job, context)
    }

    /// Replaces the stored snapshot. A snapshot that is already terminal is never
    /// overwritten.
    pub fn store(&self, job: &Job) {
        let mut jobs = self.write();
        match jobs.entries.get_mut(&job.id) {
            Some(entry) if entry.job.status.is_terminal() => return,
            Some(entry) => entry.job = job.clone(),
            None => {
                jobs.entries.insert(
                    job.id,
                    Entry {
                        job: job.clone(),
                        cancel: CancellationToken::new(),
                    },
                );
            }
        }
        if job.status.is_terminal() {
            jobs.mark_finished(job.id, self.history_limit);
        }
    }

    #[must_use]
    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.read().entries.get(&job_id).map(|entry| entry.job.clone())
    }

    #[must_use]
    pub fn cancellation_token(&self, job_id: Uuid) -> Option<CancellationToken> {
        self.read()
            .entries
            .get(&job_id)
            .map(|entry| entry.cancel.clone())
    }

    pub fn cancel(&self, job_id: Uuid) -> CancelOutcome {
        let jobs = self.read();
        match jobs.entries.get(&job_id) {
            None => CancelOutcome::NotFound,
            Some(entry) if entry.job.status.is_terminal() => {
                CancelOutcome::AlreadyTerminal(entry.job.clone())
            }
            Some(entry) => {
                entry.cancel.cancel();
                CancelOutcome::Requested(entry.job.clone())
            }
        }
    }

    /// Marks a job FAILED when its run died without reaching a terminal state.
    pub fn fail_unfinished(&self, job_id: Uuid, message: &str) {
        let mut jobs = self.write();
        let finished = jobs
            .entries
            .get_mut(&job_id)
            .is_some_and(|entry| entry.job.finish(JobStatus::Failed, message));
        if finished {
            jobs.mark_finished(job_id, self.history_limit);
        }
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.read()
            .entries
            .values()
            .filter(|entry| !entry.job.status.is_terminal())
            .count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Jobs> {
        self.jobs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Jobs> {
        self.jobs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
