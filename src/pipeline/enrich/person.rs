use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{
    clients::{
        guard::ServiceGuard,
        person_data::{PersonDataService, PersonQuery},
    },
    pipeline::adapter::{AdapterError, AdapterSettings, EnrichmentAdapter},
    store::models::{PhoneNumber, Record},
};

pub const PERSON_LOOKUP: &str = "person_lookup";

static NON_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^0-9]").expect("valid regex"));
static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid regex"));

/// NANP numbers to `+1XXXXXXXXXX`; anything else is dropped.
#[must_use]
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = NON_DIGIT.replace_all(raw, "");
    let national = match digits.chars().count() {
        10 => digits.as_ref(),
        11 if digits.starts_with('1') => &digits[1..],
        _ => return None,
    };
    // Area and exchange codes never start with 0 or 1.
    let bytes = national.as_bytes();
    if matches!(bytes[0], b'0' | b'1') || matches!(bytes[3], b'0' | b'1') {
        return None;
    }
    Some(format!("+1{national}"))
}

#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    EMAIL.is_match(&email).then_some(email)
}

/// Fills phones and emails from the person-data service.
pub struct PersonLookupAdapter {
    service: Arc<dyn PersonDataService>,
    guard: ServiceGuard,
    settings: AdapterSettings,
}

impl PersonLookupAdapter {
    #[must_use]
    pub fn new(
        service: Arc<dyn PersonDataService>,
        guard: ServiceGuard,
        settings: AdapterSettings,
    ) -> Self {
        Self {
            service,
            guard,
            settings,
        }
    }

    fn query(record: &Record) -> Result<PersonQuery, AdapterError> {
        let (Some(first_name), Some(last_name)) =
            (record.field_str("first_name"), record.field_str("last_name"))
        else {
            return Err(AdapterError::InvalidInput(
                "first_name and last_name are required".to_string(),
            ));
        };

        Ok(PersonQuery {
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            address: record.field_str("address").map(str::to_string),
            city: record.field_str("city").map(str::to_string),
            state: record.field_str("state").map(str::to_string),
            zip: record.field_str("zip").map(str::to_string),
        })
    }
}

#[async_trait]
impl EnrichmentAdapter for PersonLookupAdapter {
    fn name(&self) -> &'static str {
        PERSON_LOOKUP
    }

    fn settings(&self) -> AdapterSettings {
        self.settings
    }

    async fn process_one(&self, record: &mut Record) -> Result<(), AdapterError> {
        let query = Self::query(record)?;
        let found = self.guard.call(|| self.service.search(&query)).await?;

        let mut seen = HashSet::new();
        record.phones = found
            .phones
            .iter()
            .filter_map(|raw| normalize_phone(raw))
            .filter(|phone| seen.insert(phone.clone()))
            .map(PhoneNumber::new)
            .collect();

        let mut seen = HashSet::new();
        record.emails = found
            .emails
            .iter()
            .filter_map(|raw| normalize_email(raw))
            .filter(|email| seen.insert(email.clone()))
            .collect();

        let dropped = found.phones.len() + found.emails.len()
            - record.phones.len()
            - record.emails.len();
        if dropped > 0 {
            debug!(
                identity_key = %record.identity_key,
                dropped,
                "discarded invalid or duplicate contact points"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        clients::person_data::PersonMatch,
        store::models::CandidateRow,
        util::{circuit_breaker::CircuitBreakerConfig, error::ServiceError, retry::RetryConfig},
    };

    #[rstest]
    #[case("(202) 555-0101", Some("+12025550101"))]
    #[case("1-202-555-0101", Some("+12025550101"))]
    #[case("+1 202 555 0101", Some("+12025550101"))]
    #[case("555-0101", None)]
    #[case("(102) 555-0101", None)]
    #[case("202 155 0101", None)]
    #[case("٢٠٢٥٥", None)]
    #[case("٢٠٢٥٥٥٠١٠١", None)]
    #[case("２０２-５５５-０１０１", None)]
    fn normalizes_nanp_numbers(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_phone(raw).as_deref(), expected);
    }

    struct Fixed(Result<PersonMatch, ServiceError>);

    #[async_trait]
    impl PersonDataService for Fixed {
        async fn search(&self, _query: &PersonQuery) -> Result<PersonMatch, ServiceError> {
            self.0.clone()
        }
    }

    fn adapter(result: Result<PersonMatch, ServiceError>) -> PersonLookupAdapter {
        PersonLookupAdapter::new(
            Arc::new(Fixed(result)),
            ServiceGuard::new(
                PERSON_LOOKUP,
                RetryConfig::new(1, 0, 0),
                CircuitBreakerConfig::default(),
            ),
            AdapterSettings::default(),
        )
    }

    fn record(first: Option<&str>) -> Record {
        let mut fields = json!({"last_name": "Lovelace", "zip": "10001"});
        if let Some(first) = first {
            fields["first_name"] = json!(first);
        }
        Record::from_row(CandidateRow::new(
            "1",
            fields.as_object().cloned().unwrap_or_default(),
        ))
    }

    #[tokio::test]
    async fn fills_normalized_unique_contacts() {
        let adapter = adapter(Ok(PersonMatch {
            phones: vec![
                "(202) 555-0101".into(),
                "202.555.0101".into(),
                "12".into(),
            ],
            emails: vec!["Ada@Example.com".into(), "ada@example.com".into(), "nope".into()],
        }));
        let mut record = record(Some("Ada"));

        adapter.process_one(&mut record).await.expect("lookup succeeds");

        assert_eq!(record.phones, vec![PhoneNumber::new("+12025550101")]);
        assert_eq!(record.emails, vec!["ada@example.com".to_string()]);
    }

    #[tokio::test]
    async fn missing_name_is_invalid_input() {
        let adapter = adapter(Ok(PersonMatch::default()));
        let mut record = record(None);

        let error = adapter.process_one(&mut record).await.expect_err("invalid");
        assert!(matches!(error, AdapterError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn not_found_passes_through() {
        let adapter = adapter(Err(ServiceError::NotFound));
        let mut record = record(Some("Ada"));

        let error = adapter.process_one(&mut record).await.expect_err("missing");
        assert_eq!(error, AdapterError::NotFound);
        assert!(record.phones.is_empty());
    }
}
