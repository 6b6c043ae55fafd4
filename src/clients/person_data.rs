/// 人物データ検索サービスのクライアント。
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::http::JsonServiceClient;
use crate::util::error::ServiceError;

/// 検索条件。氏名は必須、住所系は任意。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersonQuery {
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// 検索結果。電話番号・メールは未正規化のまま返る。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PersonMatch {
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

#[async_trait]
pub trait PersonDataService: Send + Sync {
    async fn search(&self, query: &PersonQuery) -> Result<PersonMatch, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct PersonDataClient {
    http: JsonServiceClient,
}

impl PersonDataClient {
    #[must_use]
    pub fn new(http: JsonServiceClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PersonDataService for PersonDataClient {
    async fn search(&self, query: &PersonQuery) -> Result<PersonMatch, ServiceError> {
        self.http.post_json("v1/person/search", query).await
    }
}
