use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::JsonServiceClient;
use crate::util::error::ServiceError;

#[derive(Debug, Serialize)]
struct ScrubRequest<'a> {
    phones: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ScrubResponse {
    #[serde(default)]
    matches: Vec<String>,
}

/// 訴訟常習者リストの照会。`phones` のうち掲載されている番号だけを返す。
#[async_trait]
pub trait LitigatorService: Send + Sync {
    async fn scrub(&self, phones: &[String]) -> Result<HashSet<String>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct LitigatorClient {
    http: JsonServiceClient,
}

impl LitigatorClient {
    #[must_use]
    pub fn new(http: JsonServiceClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl LitigatorService for LitigatorClient {
    async fn scrub(&self, phones: &[String]) -> Result<HashSet<String>, ServiceError> {
        let response: ScrubResponse = self
            .http
            .post_json("v1/litigator/scrub", &ScrubRequest { phones })
            .await?;
        Ok(response.matches.into_iter().collect())
    }
}
