pub mod metrics;
pub mod tracing;

use std::sync::Arc;

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;
use self::tracing::TracingSettings;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、専用レジストリにメトリクスを登録する。
    ///
    /// # Errors
    /// サブスクライバ初期化またはメトリクス登録に失敗した場合。
    pub fn new(settings: &TracingSettings) -> Result<Self> {
        tracing::init(settings)?;
        Self::without_tracing()
    }

    /// サブスクライバを触らずにメトリクスだけを用意する（テスト用途）。
    ///
    /// # Errors
    /// メトリクス登録に失敗した場合。
    pub fn without_tracing() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new(Arc::clone(&registry))?);
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Prometheusテキスト形式でレンダリングする。
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
