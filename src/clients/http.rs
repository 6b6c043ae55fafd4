/// JSON over HTTP の共通クライアント。
///
/// ステータスコードは [`ServiceError`] に分類され、再試行の判断は呼び出し側
/// （[`super::guard::ServiceGuard`]）に委ねる。
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, Url, header::HeaderMap};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::util::error::ServiceError;

const API_KEY_HEADER: &str = "x-api-key";

/// 外部サービスごとの接続設定。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpServiceConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub connect_timeout: Duration,
    pub total_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct JsonServiceClient {
    service: &'static str,
    client: Client,
    base_url: Url,
    api_key: Option<String>,
}

impl JsonServiceClient {
    /// # Errors
    /// URLのパースまたはHTTPクライアントの構築に失敗した場合。
    pub fn new(service: &'static str, config: &HttpServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.total_timeout)
            .build()
            .with_context(|| format!("failed to build {service} HTTP client"))?;

        Ok(Self {
            service,
            client,
            base_url: parse_base_url(&config.base_url)
                .with_context(|| format!("invalid {service} base URL"))?,
            api_key: config.api_key.clone(),
        })
    }

    #[must_use]
    pub fn service(&self) -> &'static str {
        self.service
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `path` にJSONをPOSTし、応答をデコードする。
    ///
    /// # Errors
    /// 送信失敗、非2xx応答、デコード失敗のいずれかで [`ServiceError`] を返す。
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R, ServiceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ServiceError::InvalidInput(format!("bad request path {path}: {e}")))?;
        self.send_json(url, HeaderMap::new(), body).await
    }

    /// 任意のURLにJSONをPOSTする。Sheetsのように動的なパスを持つAPI向け。
    ///
    /// # Errors
    /// [`Self::post_json`] と同じ。
    pub async fn send_json<B, R>(
        &self,
        url: Url,
        headers: HeaderMap,
        body: &B,
    ) -> Result<R, ServiceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(url.clone()).headers(headers).json(body);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        debug!(service = self.service, %url, status = status.as_u16(), "service responded");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status, &body));
        }

        response
            .json::<R>()
            .await
            .map_err(|e| ServiceError::Malformed(e.to_string()))
    }
}

/// 末尾スラッシュを補ってから `Url::join` できる形にする。
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
