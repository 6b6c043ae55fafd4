use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::JsonServiceClient;
use crate::util::error::ServiceError;

#[derive(Debug, Serialize)]
struct LookupRequest<'a> {
    phones: &'a [String],
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    results: Vec<LookupResult>,
}

#[derive(Debug, Deserialize)]
struct LookupResult {
    phone: String,
    dnc: bool,
}

/// DNC（Do-Not-Call）登録簿の照会。電話番号ごとに登録有無を返す。
#[async_trait]
pub trait DncService: Send + Sync {
    async fn lookup(&self, phones: &[String]) -> Result<HashMap<String, bool>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct DncClient {
    http: JsonServiceClient,
}

impl DncClient {
    #[must_use]
    pub fn new(http: JsonServiceClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl DncService for DncClient {
    async fn lookup(&self, phones: &[String]) -> Result<HashMap<String, bool>, ServiceError> {
        let response: LookupResponse = self
            .http
            .post_json("v1/dnc/lookup", &LookupRequest { phones })
            .await?;
        Ok(response
            .results
            .into_iter()
            .map(|result| (result.phone, result.dnc))
            .collect())
    }
}
