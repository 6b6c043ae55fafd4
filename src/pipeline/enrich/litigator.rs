use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    clients::{guard::ServiceGuard, litigator::LitigatorService},
    pipeline::adapter::{AdapterError, AdapterSettings, EnrichmentAdapter},
    store::models::Record,
};

pub const LITIGATOR_SCREENING: &str = "litigator_screening";

/// Flags a record when any of its phones is on the litigation list.
pub struct LitigatorAdapter {
    service: Arc<dyn LitigatorService>,
    guard: ServiceGuard,
    settings: AdapterSettings,
}

impl LitigatorAdapter {
    #[must_use]
    pub fn new(
        service: Arc<dyn LitigatorService>,
        guard: ServiceGuard,
        settings: AdapterSettings,
    ) -> Self {
        Self {
            service,
            guard,
            settings,
        }
    }
}

#[async_trait]
impl EnrichmentAdapter for LitigatorAdapter {
    fn name(&self) -> &'static str {
        LITIGATOR_SCREENING
    }

    fn settings(&self) -> AdapterSettings {
        self.settings
    }

    async fn process_one(&self, record: &mut Record) -> Result<(), AdapterError> {
        // The list is keyed by phone; no phones means nothing can match.
        if record.phones.is_empty() {
            record.litigator = Some(false);
            return Ok(());
        }

        let phones: Vec<String> = record.phones.iter().map(|p| p.number.clone()).collect();
        let listed = self.guard.call(|| self.service.scrub(&phones)).await?;

        record.litigator = Some(phones.iter().any(|phone| listed.contains(phone)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::Map;

    use super::*;
    use crate::{
        store::models::{CandidateRow, PhoneNumber},
        util::{circuit_breaker::CircuitBreakerConfig, error::ServiceError, retry::RetryConfig},
    };

    struct Listed(HashSet<String>);

    #[async_trait]
    impl LitigatorService for Listed {
        async fn scrub(&self, phones: &[String]) -> Result<HashSet<String>, ServiceError> {
            Ok(phones
                .iter()
                .filter(|p| self.0.contains(*p))
                .cloned()
                .collect())
        }
    }

    fn adapter(listed: &[&str]) -> LitigatorAdapter {
        LitigatorAdapter::new(
            Arc::new(Listed(listed.iter().map(|s| (*s).to_string()).collect())),
            ServiceGuard::new(
                LITIGATOR_SCREENING,
                RetryConfig::new(1, 0, 0),
                CircuitBreakerConfig::default(),
            ),
            AdapterSettings::default(),
        )
    }

    fn record(phones: &[&str]) -> Record {
        let mut record = Record::from_row(CandidateRow::new("1", Map::new()));
        record.phones = phones.iter().map(|p| PhoneNumber::new(*p)).collect();
        record
    }

    #[tokio::test]
    async fn flags_when_any_phone_is_listed() {
        let mut hit = record(&["+12025550101", "+12025550102"]);
        let mut miss = record(&["+12025550103"]);
        let adapter = adapter(&["+12025550102"]);

        adapter.process_one(&mut hit).await.expect("scrub");
        adapter.process_one(&mut miss).await.expect("scrub");

        assert_eq!(hit.litigator, Some(true));
        assert_eq!(miss.litigator, Some(false));
    }

    #[tokio::test]
    async fn records_without_phones_are_not_flagged() {
        let mut record = record(&[]);
        adapter(&[]).process_one(&mut record).await.expect("no-op");
        assert_eq!(record.litigator, Some(false));
    }
}
