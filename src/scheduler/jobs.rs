use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::{pipeline::PipelineOrchestrator, store::models::Job};

use super::registry::{CancelOutcome, JobRegistry};

/// Per-run context handed to every stage.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub limit: usize,
    pub cancel: CancellationToken,
}

impl JobContext {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self::with_id(Uuid::now_v7(), limit, CancellationToken::new())
    }

    #[must_use]
    pub fn with_id(job_id: Uuid, limit: usize, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            limit,
            cancel,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Builds a fresh orchestrator per run, so each run owns its circuit breakers.
pub trait PipelineFactory: Send + Sync {
    /// # Errors
    /// Returns an error when a run's collaborators cannot be constructed.
    fn build(&self) -> Result<PipelineOrchestrator>;
}

#[derive(Clone)]
pub struct Scheduler {
    factory: Arc<dyn PipelineFactory>,
    registry: Arc<JobRegistry>,
    default_limit: usize,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        registry: Arc<JobRegistry>,
        default_limit: usize,
    ) -> Self {
        Self {
            factory,
            registry,
            default_limit,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Registers a PENDING job and runs it in the background.
    ///
    /// # Errors
    /// Returns an error when the pipeline for the run cannot be built; no job is
    /// registered in that case.
    pub fn start_job(&self, limit: Option<usize>) -> Result<Job> {
        let pipeline = self.factory.build()?;
        let (job, context) = self.registry.register(limit.unwrap_or(self.default_limit));
        let registry = Arc::clone(&self.registry);
        let job_id = job.id;

        info!(%job_id, limit = job.limit, "job accepted");

        tokio::spawn(async move {
            let run = tokio::spawn(async move { pipeline.execute(&context).await });
            if let Err(join_error) = run.await {
                let message = if join_error.is_panic() {
                    "pipeline task panicked"
                } else {
                    "pipeline task was aborted"
                };
                error!(%job_id, error = %join_error, "{message}");
                registry.fail_unfinished(job_id, message);
            }
        });

        Ok(job)
    }

    /// Registers a job and drives it to completion on the current task.
    ///
    /// # Errors
    /// Returns an error when the pipeline for the run cannot be built.
    pub async fn run_job(&self, limit: Option<usize>) -> Result<Job> {
        let pipeline = self.factory.build()?;
        let (_, context) = self.registry.register(limit.unwrap_or(self.default_limit));
        Ok(pipeline.execute(&context).await)
    }

    #[must_use]
    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.registry.get(job_id)
    }

    pub fn cancel(&self, job_id: Uuid) -> CancelOutcome {
        let outcome = self.registry.cancel(job_id);
        if let CancelOutcome::Requested(_) = &outcome {
            info!(%job_id, "cancellation requested");
        }
        outcome
    }
}
