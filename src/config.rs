use std::{env, net::SocketAddr, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::{
    pipeline::{
        PipelineSettings,
        adapter::{AdapterSettings, FailurePolicy},
        pool::PoolBounds,
    },
    util::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

static SQL_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

/// 環境変数名の組（アダプタごとのプール境界と失敗ポリシー）。
struct AdapterEnv {
    workers_min: &'static str,
    workers_max: &'static str,
    workers_per_batch: &'static str,
    failure_policy: &'static str,
}

const PERSON_LOOKUP_ENV: AdapterEnv = AdapterEnv {
    workers_min: "PERSON_LOOKUP_WORKERS_MIN",
    workers_max: "PERSON_LOOKUP_WORKERS_MAX",
    workers_per_batch: "PERSON_LOOKUP_WORKERS_PER_BATCH",
    failure_policy: "PERSON_LOOKUP_FAILURE_POLICY",
};

const LITIGATOR_ENV: AdapterEnv = AdapterEnv {
    workers_min: "LITIGATOR_WORKERS_MIN",
    workers_max: "LITIGATOR_WORKERS_MAX",
    workers_per_batch: "LITIGATOR_WORKERS_PER_BATCH",
    failure_policy: "LITIGATOR_FAILURE_POLICY",
};

const DNC_ENV: AdapterEnv = AdapterEnv {
    workers_min: "DNC_WORKERS_MIN",
    workers_max: "DNC_WORKERS_MAX",
    workers_per_batch: "DNC_WORKERS_PER_BATCH",
    failure_policy: "DNC_FAILURE_POLICY",
};

/// アダプタごとのプール境界と失敗ポリシー。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bounds: PoolBounds,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    warehouse_dsn: String,
    warehouse_source_table: String,
    warehouse_id_column: String,
    warehouse_cache_table: String,
    warehouse_max_connections: u32,
    warehouse_min_connections: u32,
    warehouse_acquire_timeout: Duration,
    extraction_limit: usize,
    batch_size: usize,
    batch_size_max: usize,
    cache_lookup_chunk_size: usize,
    person_lookup_base_url: String,
    person_lookup_api_key: Option<String>,
    litigator_base_url: String,
    litigator_api_key: Option<String>,
    dnc_base_url: String,
    dnc_api_key: Option<String>,
    sheets_base_url: String,
    sheets_spreadsheet_id: String,
    sheets_range: String,
    sheets_access_token: Option<String>,
    http_connect_timeout: Duration,
    http_total_timeout: Duration,
    http_max_retries: usize,
    http_backoff_base_ms: u64,
    http_backoff_cap_ms: u64,
    http_backoff_jitter_ratio: f64,
    circuit_failure_threshold: u32,
    circuit_recovery_timeout: Duration,
    person_lookup: AdapterConfig,
    litigator: AdapterConfig,
    dnc: AdapterConfig,
    progress_channel_capacity: usize,
    emit_row_events: bool,
    job_history_limit: usize,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Lead Screen Worker の設定値を読み込み、検証する。
    ///
    /// # Errors
    /// 必須の環境変数が未設定、値のパースに失敗、または値同士の整合性が取れない場合は
    /// [`ConfigError`] を返す。
    #[allow(clippy::too_many_lines)]
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("LEAD_SCREEN_HTTP_BIND", "0.0.0.0:9010")?;

        // Warehouse
        let warehouse_dsn = env_var("WAREHOUSE_DSN")?;
        let warehouse_source_table =
            parse_identifier("WAREHOUSE_SOURCE_TABLE", "lead_candidates")?;
        let warehouse_id_column = parse_identifier("WAREHOUSE_ID_COLUMN", "id")?;
        let warehouse_cache_table =
            parse_identifier("WAREHOUSE_CACHE_TABLE", "lead_screen_cache")?;
        let warehouse_max_connections = parse_u32("WAREHOUSE_MAX_CONNECTIONS", 10)?;
        let warehouse_min_connections = parse_u32("WAREHOUSE_MIN_CONNECTIONS", 1)?;
        let warehouse_acquire_timeout = parse_duration_secs("WAREHOUSE_ACQUIRE_TIMEOUT_SECS", 30)?;
        if warehouse_min_connections > warehouse_max_connections {
            return Err(ConfigError::Invalid {
                name: "WAREHOUSE_MIN_CONNECTIONS",
                source: anyhow::anyhow!(
                    "{warehouse_min_connections} exceeds WAREHOUSE_MAX_CONNECTIONS ({warehouse_max_connections})"
                ),
            });
        }

        // Batching
        let extraction_limit = parse_usize("EXTRACTION_LIMIT", 1000)?;
        let batch_size_max = parse_usize("BATCH_SIZE_MAX", 1000)?;
        let batch_size = parse_usize("BATCH_SIZE", 200)?;
        if batch_size == 0 || batch_size > batch_size_max {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                source: anyhow::anyhow!("must be between 1 and BATCH_SIZE_MAX ({batch_size_max})"),
            });
        }
        let cache_lookup_chunk_size = parse_usize("CACHE_LOOKUP_CHUNK_SIZE", 500)?.max(1);

        // External services
        let person_lookup_base_url = env_var("PERSON_LOOKUP_BASE_URL")?;
        let person_lookup_api_key = env::var("PERSON_LOOKUP_API_KEY").ok();
        let litigator_base_url = env_var("LITIGATOR_BASE_URL")?;
        let litigator_api_key = env::var("LITIGATOR_API_KEY").ok();
        let dnc_base_url = env_var("DNC_BASE_URL")?;
        let dnc_api_key = env::var("DNC_API_KEY").ok();
        let sheets_base_url = env::var("SHEETS_BASE_URL")
            .unwrap_or_else(|_| "https://sheets.googleapis.com/".to_string());
        let sheets_spreadsheet_id = env_var("SHEETS_SPREADSHEET_ID")?;
        let sheets_range = env::var("SHEETS_RANGE").unwrap_or_else(|_| "Leads!A:H".to_string());
        let sheets_access_token = env::var("SHEETS_ACCESS_TOKEN").ok();

        // HTTP timeout settings
        let http_connect_timeout = parse_duration_ms("HTTP_CONNECT_TIMEOUT_MS", 3000)?;
        let http_total_timeout = parse_duration_ms("HTTP_TOTAL_TIMEOUT_MS", 30000)?;

        // Retry settings (exponential backoff + jitter)
        let http_max_retries = parse_usize("HTTP_MAX_RETRIES", 3)?;
        let http_backoff_base_ms = parse_u64("HTTP_BACKOFF_BASE_MS", 250)?;
        let http_backoff_cap_ms = parse_u64("HTTP_BACKOFF_CAP_MS", 10000)?;
        let http_backoff_jitter_ratio = parse_ratio("HTTP_BACKOFF_JITTER_RATIO", 0.2)?;

        // Circuit breaker
        let circuit_failure_threshold = parse_u32("CIRCUIT_FAILURE_THRESHOLD", 5)?;
        let circuit_recovery_timeout = parse_duration_secs("CIRCUIT_RECOVERY_TIMEOUT_SECS", 30)?;

        // Per-adapter pools
        let person_lookup = parse_adapter(&PERSON_LOOKUP_ENV, PoolBounds::new(1, 16, 8))?;
        let litigator = parse_adapter(&LITIGATOR_ENV, PoolBounds::new(1, 8, 4))?;
        let dnc = parse_adapter(&DNC_ENV, PoolBounds::new(1, 8, 4))?;

        // Progress events
        let progress_channel_capacity = parse_usize("PROGRESS_CHANNEL_CAPACITY", 1024)?.max(1);
        let emit_row_events = parse_bool("EMIT_ROW_EVENTS", true)?;
        let job_history_limit = parse_usize("JOB_HISTORY_LIMIT", 256)?.max(1);

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_ENDPOINT").ok();
        let otel_sampling_ratio = parse_ratio("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            http_bind,
            warehouse_dsn,
            warehouse_source_table,
            warehouse_id_column,
            warehouse_cache_table,
            warehouse_max_connections,
            warehouse_min_connections,
            warehouse_acquire_timeout,
            extraction_limit,
            batch_size,
            batch_size_max,
            cache_lookup_chunk_size,
            person_lookup_base_url,
            person_lookup_api_key,
            litigator_base_url,
            litigator_api_key,
            dnc_base_url,
            dnc_api_key,
            sheets_base_url,
            sheets_spreadsheet_id,
            sheets_range,
            sheets_access_token,
            http_connect_timeout,
            http_total_timeout,
            http_max_retries,
            http_backoff_base_ms,
            http_backoff_cap_ms,
            http_backoff_jitter_ratio,
            circuit_failure_threshold,
            circuit_recovery_timeout,
            person_lookup,
            litigator,
            dnc,
            progress_channel_capacity,
            emit_row_events,
            job_history_limit,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn warehouse_dsn(&self) -> &str {
        &self.warehouse_dsn
    }

    #[must_use]
    pub fn warehouse_source_table(&self) -> &str {
        &self.warehouse_source_table
    }

    #[must_use]
    pub fn warehouse_id_column(&self) -> &str {
        &self.warehouse_id_column
    }

    #[must_use]
    pub fn warehouse_cache_table(&self) -> &str {
        &self.warehouse_cache_table
    }

    #[must_use]
    pub fn warehouse_max_connections(&self) -> u32 {
        self.warehouse_max_connections
    }

    #[must_use]
    pub fn warehouse_min_connections(&self) -> u32 {
        self.warehouse_min_connections
    }

    #[must_use]
    pub fn warehouse_acquire_timeout(&self) -> Duration {
        self.warehouse_acquire_timeout
    }

    #[must_use]
    pub fn extraction_limit(&self) -> usize {
        self.extraction_limit
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn batch_size_max(&self) -> usize {
        self.batch_size_max
    }

    #[must_use]
    pub fn cache_lookup_chunk_size(&self) -> usize {
        self.cache_lookup_chunk_size
    }

    #[must_use]
    pub fn person_lookup_base_url(&self) -> &str {
        &self.person_lookup_base_url
    }

    #[must_use]
    pub fn person_lookup_api_key(&self) -> Option<&str> {
        self.person_lookup_api_key.as_deref()
    }

    #[must_use]
    pub fn litigator_base_url(&self) -> &str {
        &self.litigator_base_url
    }

    #[must_use]
    pub fn litigator_api_key(&self) -> Option<&str> {
        self.litigator_api_key.as_deref()
    }

    #[must_use]
    pub fn dnc_base_url(&self) -> &str {
        &self.dnc_base_url
    }

    #[must_use]
    pub fn dnc_api_key(&self) -> Option<&str> {
        self.dnc_api_key.as_deref()
    }

    #[must_use]
    pub fn sheets_base_url(&self) -> &str {
        &self.sheets_base_url
    }

    #[must_use]
    pub fn sheets_spreadsheet_id(&self) -> &str {
        &self.sheets_spreadsheet_id
    }

    #[must_use]
    pub fn sheets_range(&self) -> &str {
        &self.sheets_range
    }

    #[must_use]
    pub fn sheets_access_token(&self) -> Option<&str> {
        self.sheets_access_token.as_deref()
    }

    #[must_use]
    pub fn http_connect_timeout(&self) -> Duration {
        self.http_connect_timeout
    }

    #[must_use]
    pub fn http_total_timeout(&self) -> Duration {
        self.http_total_timeout
    }

    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.http_max_retries,
            self.http_backoff_base_ms,
            self.http_backoff_cap_ms,
        )
        .with_jitter_ratio(self.http_backoff_jitter_ratio)
    }

    #[must_use]
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            recovery_timeout: self.circuit_recovery_timeout,
        }
    }

    #[must_use]
    pub fn person_lookup_settings(&self) -> AdapterSettings {
        self.adapter_settings(self.person_lookup)
    }

    #[must_use]
    pub fn litigator_settings(&self) -> AdapterSettings {
        self.adapter_settings(self.litigator)
    }

    #[must_use]
    pub fn dnc_settings(&self) -> AdapterSettings {
        self.adapter_settings(self.dnc)
    }

    #[must_use]
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            batch_size: self.batch_size,
            emit_row_events: self.emit_row_events,
        }
    }

    #[must_use]
    pub fn progress_channel_capacity(&self) -> usize {
        self.progress_channel_capacity
    }

    /// 保持する終了済みジョブのスナップショット数。
    #[must_use]
    pub fn job_history_limit(&self) -> usize {
        self.job_history_limit
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }

    fn adapter_settings(&self, adapter: AdapterConfig) -> AdapterSettings {
        AdapterSettings {
            bounds: adapter.bounds,
            batch_size: self.batch_size,
            failure_policy: adapter.failure_policy,
        }
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

/// テーブル名・カラム名はSQLに埋め込まれるため、識別子として妥当なものだけを受け付ける。
fn parse_identifier(name: &'static str, default: &str) -> Result<String, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    if SQL_IDENTIFIER.is_match(&raw) {
        Ok(raw)
    } else {
        Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("not a plain SQL identifier: {raw}"),
        })
    }
}

fn parse_adapter(names: &AdapterEnv, defaults: PoolBounds) -> Result<AdapterConfig, ConfigError> {
    let min_workers = parse_usize(names.workers_min, defaults.min_workers)?;
    let max_workers = parse_usize(names.workers_max, defaults.max_workers)?;
    let workers_per_batch = parse_usize(names.workers_per_batch, defaults.workers_per_batch)?;
    if max_workers == 0 || min_workers > max_workers {
        return Err(ConfigError::Invalid {
            name: names.workers_min,
            source: anyhow::anyhow!(
                "min ({min_workers}) must not exceed max ({max_workers}), and max must be positive"
            ),
        });
    }

    let failure_policy = match env::var(names.failure_policy) {
        Ok(raw) => FailurePolicy::parse(&raw).ok_or_else(|| ConfigError::Invalid {
            name: names.failure_policy,
            source: anyhow::anyhow!("expected mark_and_continue or fail_batch, got {raw}"),
        })?,
        Err(_) => FailurePolicy::default(),
    };

    Ok(AdapterConfig {
        bounds: PoolBounds::new(min_workers, max_workers, workers_per_batch),
        failure_policy,
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_ratio(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0 and 1"),
        });
    }
    Ok(parsed)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
