use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::warn;

use crate::{
    api,
    clients::{
        DncClient, DncService, HttpServiceConfig, JsonServiceClient, LitigatorClient,
        LitigatorService, PersonDataClient, PersonDataService, ServiceGuard, SheetsClient,
        SheetsTarget,
    },
    config::Config,
    observability::{Telemetry, metrics::Metrics, tracing::TracingSettings},
    pipeline::{
        PipelineOrchestrator, PipelineSettings,
        adapter::AdapterSettings,
        dedup::CacheDedupStage,
        enrich::{DncAdapter, LitigatorAdapter, PersonLookupAdapter},
        extract::WarehouseExtractStage,
        progress::ProgressBus,
        publish::{SheetAndCachePublishStage, SpreadsheetSink},
    },
    scheduler::{JobRegistry, PipelineFactory, Scheduler},
    store::warehouse::{PgWarehouse, Warehouse},
    util::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

const PERSON_DATA_SERVICE: &str = "person_data";
const LITIGATOR_SERVICE: &str = "litigator";
const DNC_SERVICE: &str = "dnc";
const SHEETS_SERVICE: &str = "sheets";

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    scheduler: Scheduler,
    progress: Arc<ProgressBus>,
    warehouse: Arc<dyn Warehouse>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.registry.scheduler
    }

    pub(crate) fn progress(&self) -> &Arc<ProgressBus> {
        &self.registry.progress
    }

    pub(crate) fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.registry.warehouse
    }
}

/// Where a run appends its spreadsheet rows.
#[derive(Clone)]
pub enum SpreadsheetDestination {
    /// Google Sheets values-append, guarded by a breaker owned by each run.
    Sheets {
        http: JsonServiceClient,
        target: SheetsTarget,
    },
    /// A preconstructed sink shared by every run.
    Sink(Arc<dyn SpreadsheetSink>),
}

/// The external collaborators a screening run talks to.
#[derive(Clone)]
pub struct ScreeningServices {
    pub warehouse: Arc<dyn Warehouse>,
    pub person_data: Arc<dyn PersonDataService>,
    pub litigator: Arc<dyn LitigatorService>,
    pub dnc: Arc<dyn DncService>,
    pub spreadsheet: SpreadsheetDestination,
}

#[derive(Debug, Clone, Copy)]
pub struct ScreeningSettings {
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub person_lookup: AdapterSettings,
    pub litigator: AdapterSettings,
    pub dnc: AdapterSettings,
    pub pipeline: PipelineSettings,
    pub cache_lookup_chunk_size: usize,
}

impl ScreeningSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry: config.retry_config(),
            breaker: config.circuit_breaker_config(),
            person_lookup: config.person_lookup_settings(),
            litigator: config.litigator_settings(),
            dnc: config.dnc_settings(),
            pipeline: config.pipeline_settings(),
            cache_lookup_chunk_size: config.cache_lookup_chunk_size(),
        }
    }
}

/// Wires the person lookup, litigator and DNC adapters into a fresh orchestrator per run.
pub struct ScreeningPipelineFactory {
    services: ScreeningServices,
    settings: ScreeningSettings,
    registry: Arc<JobRegistry>,
    progress: Arc<ProgressBus>,
    metrics: Option<Arc<Metrics>>,
}

impl ScreeningPipelineFactory {
    #[must_use]
    pub fn new(
        services: ScreeningServices,
        settings: ScreeningSettings,
        registry: Arc<JobRegistry>,
        progress: Arc<ProgressBus>,
    ) -> Self {
        Self {
            services,
            settings,
            registry,
            progress,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn guard(&self, service: &'static str) -> ServiceGuard {
        let guard = ServiceGuard::new(service, self.settings.retry, self.settings.breaker);
        match &self.metrics {
            Some(metrics) => guard.with_metrics(Arc::clone(metrics)),
            None => guard,
        }
    }

    fn spreadsheet(&self) -> Arc<dyn SpreadsheetSink> {
        match &self.services.spreadsheet {
            SpreadsheetDestination::Sheets { http, target } => Arc::new(SheetsClient::new(
                http.clone(),
                self.guard(SHEETS_SERVICE),
                target.clone(),
            )),
            SpreadsheetDestination::Sink(sink) => Arc::clone(sink),
        }
    }
}

impl PipelineFactory for ScreeningPipelineFactory {
    fn build(&self) -> Result<PipelineOrchestrator> {
        let warehouse = &self.services.warehouse;
        let mut builder = PipelineOrchestrator::builder(Arc::clone(&self.registry))
            .with_settings(self.settings.pipeline)
            .with_extract_stage(Arc::new(WarehouseExtractStage::new(Arc::clone(warehouse))))
            .with_dedup_stage(Arc::new(CacheDedupStage::new(
                Arc::clone(warehouse),
                self.settings.cache_lookup_chunk_size,
            )))
            .with_adapter(Arc::new(PersonLookupAdapter::new(
                Arc::clone(&self.services.person_data),
                self.guard(PERSON_DATA_SERVICE),
                self.settings.person_lookup,
            )))
            .with_adapter(Arc::new(LitigatorAdapter::new(
                Arc::clone(&self.services.litigator),
                self.guard(LITIGATOR_SERVICE),
                self.settings.litigator,
            )))
            .with_adapter(Arc::new(DncAdapter::new(
                Arc::clone(&self.services.dnc),
                self.guard(DNC_SERVICE),
                self.settings.dnc,
            )))
            .with_publish_stage(Arc::new(SheetAndCachePublishStage::new(
                self.spreadsheet(),
                Arc::clone(warehouse),
            )))
            .with_publisher(self.progress.clone());
        if let Some(metrics) = &self.metrics {
            builder = builder.with_metrics(Arc::clone(metrics));
        }
        builder.build()
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// # Errors
    /// Telemetry の初期化や HTTP クライアント・接続プールの構築が失敗した場合はエラーを返す。
    pub fn build(config: &Config) -> Result<Self> {
        let telemetry = Telemetry::new(&TracingSettings {
            otlp_endpoint: config.otel_exporter_endpoint().map(ToString::to_string),
            sampling_ratio: config.otel_sampling_ratio(),
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.warehouse_max_connections())
            .min_connections(config.warehouse_min_connections())
            .acquire_timeout(config.warehouse_acquire_timeout())
            .test_before_acquire(true)
            .connect_lazy(config.warehouse_dsn())
            .context("failed to configure warehouse connection pool")?;
        let warehouse: Arc<dyn Warehouse> = Arc::new(PgWarehouse::new(
            pool,
            config.warehouse_source_table(),
            config.warehouse_id_column(),
            config.warehouse_cache_table(),
        ));

        let http = |base_url: &str, api_key: Option<&str>| HttpServiceConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(ToString::to_string),
            connect_timeout: config.http_connect_timeout(),
            total_timeout: config.http_total_timeout(),
        };
        let person_data = PersonDataClient::new(JsonServiceClient::new(
            PERSON_DATA_SERVICE,
            &http(config.person_lookup_base_url(), config.person_lookup_api_key()),
        )?);
        let litigator = LitigatorClient::new(JsonServiceClient::new(
            LITIGATOR_SERVICE,
            &http(config.litigator_base_url(), config.litigator_api_key()),
        )?);
        let dnc = DncClient::new(JsonServiceClient::new(
            DNC_SERVICE,
            &http(config.dnc_base_url(), config.dnc_api_key()),
        )?);
        let sheets_http =
            JsonServiceClient::new(SHEETS_SERVICE, &http(config.sheets_base_url(), None))?;
        if config.sheets_access_token().is_none() {
            warn!("SHEETS_ACCESS_TOKEN is not set; spreadsheet appends will be rejected");
        }

        let services = ScreeningServices {
            warehouse: Arc::clone(&warehouse),
            person_data: Arc::new(person_data),
            litigator: Arc::new(litigator),
            dnc: Arc::new(dnc),
            spreadsheet: SpreadsheetDestination::Sheets {
                http: sheets_http,
                target: SheetsTarget {
                    spreadsheet_id: config.sheets_spreadsheet_id().to_string(),
                    range: config.sheets_range().to_string(),
                    access_token: config.sheets_access_token().unwrap_or_default().to_string(),
                },
            },
        };

        let jobs = Arc::new(JobRegistry::with_history_limit(config.job_history_limit()));
        let progress = Arc::new(ProgressBus::new(config.progress_channel_capacity()));
        let factory = ScreeningPipelineFactory::new(
            services,
            ScreeningSettings::from_config(config),
            Arc::clone(&jobs),
            Arc::clone(&progress),
        )
        .with_metrics(Arc::clone(telemetry.metrics()));
        let scheduler = Scheduler::new(Arc::new(factory), jobs, config.extraction_limit());

        Ok(Self::from_parts(telemetry, scheduler, progress, warehouse))
    }

    /// Assembles a registry from already-built parts.
    #[must_use]
    pub fn from_parts(
        telemetry: Telemetry,
        scheduler: Scheduler,
        progress: Arc<ProgressBus>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            telemetry,
            scheduler,
            progress,
            warehouse,
        }
    }

    #[must_use]
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, HashSet};

    use async_trait::async_trait;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::{
        clients::person_data::{PersonMatch, PersonQuery},
        pipeline::publish::SheetRow,
        store::{memory::InMemoryWarehouse, models::CandidateRow},
        util::error::ServiceError,
    };

    pub(crate) struct EchoPerson;

    #[async_trait]
    impl PersonDataService for EchoPerson {
        async fn search(&self, _query: &PersonQuery) -> Result<PersonMatch, ServiceError> {
            Ok(PersonMatch {
                phones: vec!["(202) 555-0101".into()],
                emails: vec!["lead@example.com".into()],
            })
        }
    }

    pub(crate) struct NobodyListed;

    #[async_trait]
    impl LitigatorService for NobodyListed {
        async fn scrub(&self, _phones: &[String]) -> Result<HashSet<String>, ServiceError> {
            Ok(HashSet::new())
        }
    }

    #[async_trait]
    impl DncService for NobodyListed {
        async fn lookup(&self, phones: &[String]) -> Result<HashMap<String, bool>, ServiceError> {
            Ok(phones.iter().map(|p| (p.clone(), false)).collect())
        }
    }

    pub(crate) struct DiscardSheet;

    #[async_trait]
    impl SpreadsheetSink for DiscardSheet {
        async fn append_rows(
            &self,
            _job_id: Uuid,
            _batch: usize,
            _rows: &[SheetRow],
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn warehouse(rows: usize) -> Arc<InMemoryWarehouse> {
        Arc::new(InMemoryWarehouse::with_rows(
            (0..rows)
                .map(|i| {
                    let fields = json!({"first_name": format!("Lead{i}"), "last_name": "Smith"});
                    CandidateRow::new(i.to_string(), fields.as_object().cloned().unwrap_or_default())
                })
                .collect(),
        ))
    }

    /// Pipeline factory over in-memory collaborators, sharing the given job registry and bus.
    pub(crate) fn factory(
        warehouse: Arc<InMemoryWarehouse>,
        jobs: Arc<JobRegistry>,
        progress: Arc<ProgressBus>,
    ) -> ScreeningPipelineFactory {
        let services = ScreeningServices {
            warehouse,
            person_data: Arc::new(EchoPerson),
            litigator: Arc::new(NobodyListed),
            dnc: Arc::new(NobodyListed),
            spreadsheet: SpreadsheetDestination::Sink(Arc::new(DiscardSheet)),
        };
        let settings = ScreeningSettings {
            retry: RetryConfig::new(1, 0, 0),
            breaker: CircuitBreakerConfig::default(),
            person_lookup: AdapterSettings::default(),
            litigator: AdapterSettings::default(),
            dnc: AdapterSettings::default(),
            pipeline: PipelineSettings::default(),
            cache_lookup_chunk_size: 100,
        };
        ScreeningPipelineFactory::new(services, settings, jobs, progress)
    }

    /// A registry wired to in-memory collaborators.
    pub(crate) fn registry(warehouse: Arc<InMemoryWarehouse>) -> ComponentRegistry {
        let telemetry = Telemetry::without_tracing().expect("metrics register");
        let jobs = Arc::new(JobRegistry::new());
        let progress = Arc::new(ProgressBus::new(64));
        let factory = factory(warehouse.clone(), Arc::clone(&jobs), Arc::clone(&progress))
            .with_metrics(Arc::clone(telemetry.metrics()));
        let scheduler = Scheduler::new(Arc::new(factory), jobs, 50);
        ComponentRegistry::from_parts(telemetry, scheduler, progress, warehouse)
    }
}
