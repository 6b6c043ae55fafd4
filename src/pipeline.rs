//! Screening pipeline orchestrator and builder.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    observability::metrics::Metrics,
    scheduler::{JobContext, JobRegistry},
    store::models::{Job, JobStatus, Record},
    util::partial_success::PartialSuccessAnalysis,
};

pub mod adapter;
pub mod aggregate;
pub mod dedup;
pub mod enrich;
pub mod extract;
pub mod pool;
pub mod progress;
pub mod publish;

use adapter::{EnrichmentAdapter, FailurePolicy};
use aggregate::BatchResult;
use dedup::DedupStage;
use extract::ExtractStage;
use progress::{EventEmitter, NoopPublisher, ProgressPayload, ProgressPublisher};
use publish::PublishStage;

/// Errors that end a run in FAILED. Per-record adapter failures never reach this type.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0:#}")]
    Extraction(anyhow::Error),
    #[error("{adapter} unavailable for every record in batch {batch}")]
    StageUnavailable { adapter: String, batch: usize },
    #[error("publish failed for batch {batch}: {source:#}")]
    Publish { batch: usize, source: anyhow::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    /// Emit one `row_processed` event per published record.
    pub emit_row_events: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            emit_row_events: true,
        }
    }
}

/// How a run stopped without an error.
enum RunEnd {
    Completed,
    Cancelled { published_batches: usize },
}

enum BatchStep {
    Published,
    Cancelled,
}

pub struct PipelineOrchestrator {
    stages: PipelineStages,
    settings: PipelineSettings,
    registry: Arc<JobRegistry>,
    publisher: Arc<dyn ProgressPublisher>,
    metrics: Option<Arc<Metrics>>,
}

struct PipelineStages {
    extract: Arc<dyn ExtractStage>,
    dedup: Arc<dyn DedupStage>,
    adapters: Vec<Arc<dyn EnrichmentAdapter>>,
    publish: Arc<dyn PublishStage>,
}

pub struct PipelineBuilder {
    registry: Arc<JobRegistry>,
    settings: PipelineSettings,
    extract: Option<Arc<dyn ExtractStage>>,
    dedup: Option<Arc<dyn DedupStage>>,
    adapters: Vec<Arc<dyn EnrichmentAdapter>>,
    publish: Option<Arc<dyn PublishStage>>,
    publisher: Option<Arc<dyn ProgressPublisher>>,
    metrics: Option<Arc<Metrics>>,
}

impl PipelineOrchestrator {
    #[must_use]
    pub fn builder(registry: Arc<JobRegistry>) -> PipelineBuilder {
        PipelineBuilder::new(registry)
    }

    /// Drives one job to a terminal state and returns its final snapshot.
    ///
    /// Never returns an error: every failure is folded into the job's status, message
    /// and the terminal progress event.
    pub async fn execute(&self, ctx: &JobContext) -> Job {
        let mut job = self
            .registry
            .get(ctx.job_id)
            .unwrap_or_else(|| Job::new(ctx.job_id, ctx.limit));
        if !job.start() {
            warn!(job_id = %ctx.job_id, status = %job.status, "job is not pending, run skipped");
            return job;
        }
        self.registry.store(&job);

        let started = Instant::now();
        self.record_metric(|m| {
            m.jobs_started.inc();
            m.active_jobs.inc();
        });
        info!(job_id = %ctx.job_id, limit = ctx.limit, "screening run started");

        let mut emitter = EventEmitter::new(ctx.job_id, Arc::clone(&self.publisher));
        let mut analysis = PartialSuccessAnalysis::new();
        let result = self.run(ctx, &mut job, &mut emitter, &mut analysis).await;

        for note in analysis.notes() {
            job.add_note(note);
        }

        let payload = match result {
            Ok(RunEnd::Completed) => {
                let message = if analysis.is_partial() {
                    format!(
                        "completed with partial results: {} records screened, degraded: {}",
                        job.counters.total_processed,
                        analysis.degraded_stages().join(", ")
                    )
                } else {
                    format!("completed: {} records screened", job.counters.total_processed)
                };
                job.finish(JobStatus::Completed, message);
                self.record_metric(|m| m.jobs_completed.inc());
                ProgressPayload::JobCompleted {
                    counters: job.counters,
                    notes: job.notes.clone(),
                }
            }
            Ok(RunEnd::Cancelled { published_batches }) => {
                job.finish(
                    JobStatus::Cancelled,
                    format!(
                        "cancelled after {published_batches} of {} batches",
                        job.total_batches
                    ),
                );
                self.record_metric(|m| m.jobs_cancelled.inc());
                ProgressPayload::JobCancelled {
                    counters: job.counters,
                }
            }
            Err(error) => {
                let message = error.to_string();
                warn!(job_id = %ctx.job_id, error = %message, "screening run failed");
                job.finish(JobStatus::Failed, message.clone());
                self.record_metric(|m| m.jobs_failed.inc());
                ProgressPayload::JobFailed {
                    error: message,
                    counters: job.counters,
                }
            }
        };

        // Snapshot first so a reader woken by the terminal event sees the terminal state.
        self.registry.store(&job);
        emitter.emit(payload);
        emitter.close();

        self.record_metric(|m| {
            m.active_jobs.dec();
            m.job_duration.observe(started.elapsed().as_secs_f64());
        });
        info!(
            job_id = %ctx.job_id,
            status = %job.status,
            extracted = job.counters.extracted,
            skipped = job.counters.skipped,
            processed = job.counters.total_processed,
            litigator = job.counters.litigator_count,
            dnc = job.counters.dnc_count,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "screening run finished"
        );
        job
    }

    #[allow(clippy::cast_precision_loss)]
    async fn run(
        &self,
        ctx: &JobContext,
        job: &mut Job,
        emitter: &mut EventEmitter,
        analysis: &mut PartialSuccessAnalysis,
    ) -> Result<RunEnd, PipelineError> {
        self.enter_stage(job, emitter, "extract", None);
        let extracted = self
            .stages
            .extract
            .extract(ctx)
            .await
            .map_err(PipelineError::Extraction)?;
        job.counters.extracted = extracted.rows_extracted;
        job.counters.skipped = extracted.duplicates;

        self.enter_stage(job, emitter, "dedup", None);
        let filtered = self.stages.dedup.filter(ctx, extracted.records).await;
        job.counters.skipped += filtered.skipped;
        if let Some(note) = filtered.degraded {
            job.add_note(note);
        }
        self.record_metric(|m| {
            m.rows_extracted.inc_by(extracted.rows_extracted as f64);
            m.records_skipped
                .inc_by((extracted.duplicates + filtered.skipped) as f64);
        });

        let batch_size = self.settings.batch_size.max(1);
        job.total_rows = filtered.records.len();
        job.total_batches = filtered.records.len().div_ceil(batch_size);
        self.registry.store(job);

        let mut records = filtered.records.into_iter();
        for index in 0..job.total_batches {
            if ctx.is_cancelled() {
                info!(job_id = %ctx.job_id, batch = index + 1, "cancellation observed before batch");
                return Ok(RunEnd::Cancelled {
                    published_batches: index,
                });
            }

            let batch: Vec<Record> = records.by_ref().take(batch_size).collect();
            match self.process_batch(ctx, job, emitter, analysis, index, batch).await? {
                BatchStep::Published => {}
                BatchStep::Cancelled => {
                    return Ok(RunEnd::Cancelled {
                        published_batches: index,
                    });
                }
            }
        }

        Ok(RunEnd::Completed)
    }

    #[allow(clippy::cast_precision_loss, clippy::too_many_lines)]
    async fn process_batch(
        &self,
        ctx: &JobContext,
        job: &mut Job,
        emitter: &mut EventEmitter,
        analysis: &mut PartialSuccessAnalysis,
        index: usize,
        mut records: Vec<Record>,
    ) -> Result<BatchStep, PipelineError> {
        let batch_started = Instant::now();
        let batch_number = index + 1;
        job.current_batch = batch_number;
        let mut summaries = Vec::with_capacity(self.stages.adapters.len());

        for adapter in &self.stages.adapters {
            if ctx.is_cancelled() {
                info!(
                    job_id = %ctx.job_id,
                    batch = batch_number,
                    adapter = adapter.name(),
                    "cancellation observed mid-batch, batch discarded"
                );
                return Ok(BatchStep::Cancelled);
            }

            self.enter_stage(job, emitter, adapter.name(), Some(batch_number));
            let adapter_started = Instant::now();
            let outcome = adapter.process_batch(records).await;

            self.record_metric(|m| {
                m.adapter_batch_duration
                    .with_label_values(&[adapter.name()])
                    .observe(adapter_started.elapsed().as_secs_f64());
                for failed in outcome.outcomes.iter().filter_map(|o| o.result.as_ref().err()) {
                    m.adapter_failures
                        .with_label_values(&[adapter.name(), failed.kind().as_str()])
                        .inc();
                }
            });

            if adapter.settings().failure_policy == FailurePolicy::FailBatch
                && outcome.summary.dependency_unavailable()
            {
                return Err(PipelineError::StageUnavailable {
                    adapter: adapter.name().to_string(),
                    batch: batch_number,
                });
            }

            summaries.push(outcome.summary.clone());
            records = outcome.into_records();
        }

        let result = BatchResult::new(index, records, summaries);
        self.enter_stage(job, emitter, "publish", Some(batch_number));
        let report = self
            .stages
            .publish
            .publish(ctx, &result)
            .await
            .map_err(|source| PipelineError::Publish {
                batch: batch_number,
                source,
            })?;
        if let Some(error) = report.cache_error {
            job.add_note(format!(
                "cache write-back failed for batch {batch_number}: {error}"
            ));
        }

        let tally = result.tally();
        tally.apply_to(&mut job.counters);
        for summary in &result.summaries {
            analysis.record(summary);
        }
        self.record_metric(|m| {
            m.records_processed.inc_by(tally.processed as f64);
            m.litigators_flagged.inc_by(tally.litigator as f64);
            m.dnc_flagged.inc_by(tally.dnc as f64);
        });

        if self.settings.emit_row_events {
            for (offset, record) in result.records.iter().enumerate() {
                emitter.emit(ProgressPayload::RowProcessed {
                    row: job.current_row + offset + 1,
                    total_rows: job.total_rows,
                    identity_key: record.identity_key.clone(),
                    outcome: record.outcome(),
                    litigator: record.is_litigator(),
                    dnc: record.is_dnc(),
                });
            }
        }
        job.current_row += result.records.len();
        job.progress_percent = percent(batch_number, job.total_batches);
        self.registry.store(job);

        emitter.emit(ProgressPayload::BatchProgress {
            percent: job.progress_percent,
            current_batch: batch_number,
            total_batches: job.total_batches,
            current_row: job.current_row,
            total_rows: job.total_rows,
            counters: job.counters,
        });

        self.record_metric(|m| {
            m.batch_duration
                .observe(batch_started.elapsed().as_secs_f64());
        });
        info!(
            job_id = %ctx.job_id,
            batch = batch_number,
            total_batches = job.total_batches,
            processed = tally.processed,
            litigator = tally.litigator,
            dnc = tally.dnc,
            partial = tally.partial,
            failed = tally.failed,
            "batch completed"
        );

        Ok(BatchStep::Published)
    }

    fn enter_stage(
        &self,
        job: &mut Job,
        emitter: &mut EventEmitter,
        stage: &str,
        batch: Option<usize>,
    ) {
        debug!(job_id = %job.id, stage, batch, "stage started");
        job.current_stage = Some(stage.to_string());
        self.registry.store(job);
        emitter.emit(ProgressPayload::StageStarted {
            stage: stage.to_string(),
            batch,
        });
    }

    fn record_metric(&self, f: impl FnOnce(&Metrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics);
        }
    }
}

fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    u8::try_from(done.min(total) * 100 / total).unwrap_or(100)
}

impl PipelineBuilder {
    #[must_use]
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self {
            registry,
            settings: PipelineSettings::default(),
            extract: None,
            dedup: None,
            adapters: Vec::new(),
            publish: None,
            publisher: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_extract_stage(mut self, stage: Arc<dyn ExtractStage>) -> Self {
        self.extract = Some(stage);
        self
    }

    #[must_use]
    pub fn with_dedup_stage(mut self, stage: Arc<dyn DedupStage>) -> Self {
        self.dedup = Some(stage);
        self
    }

    /// Adapters run in the order they are added.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn EnrichmentAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn with_publish_stage(mut self, stage: Arc<dyn PublishStage>) -> Self {
        self.publish = Some(stage);
        self
    }

    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ProgressPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// # Errors
    /// Returns an error when the extract, dedup or publish stage is missing.
    pub fn build(self) -> anyhow::Result<PipelineOrchestrator> {
        let stages = PipelineStages {
            extract: self
                .extract
                .context("extract stage must be configured before build")?,
            dedup: self
                .dedup
                .context("dedup stage must be configured before build")?,
            adapters: self.adapters,
            publish: self
                .publish
                .context("publish stage must be configured before build")?,
        };

        Ok(PipelineOrchestrator {
            stages,
            settings: self.settings,
            registry: self.registry,
            publisher: self.publisher.unwrap_or_else(|| Arc::new(NoopPublisher)),
            metrics: self.metrics,
        })
    }
}
