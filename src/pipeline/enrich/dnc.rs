use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    clients::{dnc::DncService, guard::ServiceGuard},
    pipeline::adapter::{AdapterError, AdapterSettings, EnrichmentAdapter},
    store::models::Record,
};

pub const DNC_SCREENING: &str = "dnc_screening";

/// Marks each phone as on or off the do-not-call registry.
pub struct DncAdapter {
    service: Arc<dyn DncService>,
    guard: ServiceGuard,
    settings: AdapterSettings,
}

impl DncAdapter {
    #[must_use]
    pub fn new(service: Arc<dyn DncService>, guard: ServiceGuard, settings: AdapterSettings) -> Self {
        Self {
            service,
            guard,
            settings,
        }
    }

    #[must_use]
    pub fn guard(&self) -> &ServiceGuard {
        &self.guard
    }
}

#[async_trait]
impl EnrichmentAdapter for DncAdapter {
    fn name(&self) -> &'static str {
        DNC_SCREENING
    }

    fn settings(&self) -> AdapterSettings {
        self.settings
    }

    async fn process_one(&self, record: &mut Record) -> Result<(), AdapterError> {
        if record.phones.is_empty() {
            debug!(identity_key = %record.identity_key, "no phones, dnc not applicable");
            return Ok(());
        }

        let phones: Vec<String> = record.phones.iter().map(|p| p.number.clone()).collect();
        let listed = self.guard.call(|| self.service.lookup(&phones)).await?;

        let mut missing = 0;
        for phone in &mut record.phones {
            match listed.get(&phone.number) {
                Some(dnc) => phone.dnc = Some(*dnc),
                None => missing += 1,
            }
        }

        if missing > 0 {
            return Err(AdapterError::Rejected(format!(
                "dnc response omitted {missing} of {} phones",
                phones.len()
            )));
        }
        Ok(())
    }
}
