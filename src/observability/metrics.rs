/// Prometheusメトリクス定義。
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_gauge_with_registry, register_histogram_vec_with_registry,
    register_histogram_with_registry,
};
use std::sync::Arc;

const BATCH_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // ジョブ
    pub jobs_started: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_cancelled: Counter,

    // レコード
    pub rows_extracted: Counter,
    pub records_skipped: Counter,
    pub records_processed: Counter,
    pub litigators_flagged: Counter,
    pub dnc_flagged: Counter,
    pub adapter_failures: CounterVec,

    // 外部呼び出し
    pub retries: CounterVec,
    pub circuit_rejections: CounterVec,

    // ヒストグラム
    pub batch_duration: Histogram,
    pub adapter_batch_duration: HistogramVec,
    pub job_duration: Histogram,

    // ゲージ
    pub active_jobs: Gauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成し、`registry` に登録する。
    ///
    /// # Errors
    /// 同名メトリクスが既に登録されている場合はエラーを返す。
    #[allow(clippy::too_many_lines)]
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            jobs_started: register_counter_with_registry!(
                "lead_screen_jobs_started_total",
                "Total number of screening jobs started",
                registry
            )?,
            jobs_completed: register_counter_with_registry!(
                "lead_screen_jobs_completed_total",
                "Total number of screening jobs completed",
                registry
            )?,
            jobs_failed: register_counter_with_registry!(
                "lead_screen_jobs_failed_total",
                "Total number of screening jobs that failed",
                registry
            )?,
            jobs_cancelled: register_counter_with_registry!(
                "lead_screen_jobs_cancelled_total",
                "Total number of screening jobs cancelled",
                registry
            )?,
            rows_extracted: register_counter_with_registry!(
                "lead_screen_rows_extracted_total",
                "Rows returned by warehouse extraction",
                registry
            )?,
            records_skipped: register_counter_with_registry!(
                "lead_screen_records_skipped_total",
                "Records skipped as already processed or duplicated",
                registry
            )?,
            records_processed: register_counter_with_registry!(
                "lead_screen_records_processed_total",
                "Records screened and published",
                registry
            )?,
            litigators_flagged: register_counter_with_registry!(
                "lead_screen_litigators_flagged_total",
                "Records flagged by litigator screening",
                registry
            )?,
            dnc_flagged: register_counter_with_registry!(
                "lead_screen_dnc_flagged_total",
                "Records with at least one do-not-call phone",
                registry
            )?,
            adapter_failures: register_counter_vec_with_registry!(
                "lead_screen_adapter_failures_total",
                "Per-record adapter failures",
                &["adapter", "kind"],
                registry
            )?,
            retries: register_counter_vec_with_registry!(
                "lead_screen_retries_total",
                "Retried external calls",
                &["service"],
                registry
            )?,
            circuit_rejections: register_counter_vec_with_registry!(
                "lead_screen_circuit_rejections_total",
                "Calls rejected by an open circuit breaker",
                &["service"],
                registry
            )?,
            batch_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "lead_screen_batch_duration_seconds",
                    "Wall time to screen, aggregate and publish one batch"
                )
                .buckets(BATCH_BUCKETS.to_vec()),
                registry
            )?,
            adapter_batch_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "lead_screen_adapter_batch_duration_seconds",
                    "Wall time for one adapter stage over one batch"
                )
                .buckets(BATCH_BUCKETS.to_vec()),
                &["adapter"],
                registry
            )?,
            job_duration: register_histogram_with_registry!(
                HistogramOpts::new(
                    "lead_screen_job_duration_seconds",
                    "Wall time of a screening job"
                )
                .buckets(vec![10.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
                registry
            )?,
            active_jobs: register_gauge_with_registry!(
                "lead_screen_active_jobs",
                "Screening jobs currently running",
                registry
            )?,
        })
    }
}
