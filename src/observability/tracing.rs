use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "lead-screen-worker";

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// OTLPエクスポート設定。エンドポイント未設定ならfmtレイヤーのみ。
#[derive(Debug, Clone, PartialEq)]
pub struct TracingSettings {
    pub otlp_endpoint: Option<String>,
    pub sampling_ratio: f64,
}

impl Default for TracingSettings {
    fn default() -> Self {
        Self {
            otlp_endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

/// Tracing サブスクライバを一度だけ初期化する。
///
/// `RUST_LOG` が未設定なら `info`。ログはJSONで出力する。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init(settings: &TracingSettings) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

        let tracer = match settings.otlp_endpoint.as_deref() {
            Some(endpoint) => match init_tracer(endpoint, settings.sampling_ratio) {
                Ok(tracer) => Some(tracer),
                Err(e) => {
                    // サブスクライバ初期化前なので標準エラーへ
                    eprintln!("OpenTelemetry exporter disabled: {e:#}");
                    None
                }
            },
            None => None,
        };
        let otel_enabled = tracer.is_some();
        let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()
            .map_err(|e: tracing_subscriber::util::TryInitError| Error::msg(e.to_string()))?;

        info!(
            otel_enabled,
            endpoint = settings.otlp_endpoint.as_deref().unwrap_or(""),
            "tracing initialized"
        );
        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// OTLPエクスポーター経由でOpenTelemetryトレーサーを初期化する。
///
/// # Errors
/// トレーサーの初期化に失敗した場合はエラーを返す。
fn init_tracer(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
