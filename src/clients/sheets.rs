/// スプレッドシート（Sheets values:append API）への行追記クライアント。
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{guard::ServiceGuard, headers::build_append_headers, http::JsonServiceClient};
use crate::pipeline::publish::{SheetRow, SpreadsheetSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetsTarget {
    pub spreadsheet_id: String,
    /// A1 形式の範囲（例: `Leads!A:H`）
    pub range: String,
    pub access_token: String,
}

#[derive(Debug, Serialize)]
struct AppendRequest {
    values: Vec<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    #[serde(default)]
    updates: Option<AppendUpdates>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    #[serde(default)]
    updated_rows: Option<u64>,
    #[serde(default)]
    updated_range: Option<String>,
}

pub struct SheetsClient {
    http: JsonServiceClient,
    guard: ServiceGuard,
    target: SheetsTarget,
}

impl SheetsClient {
    #[must_use]
    pub fn new(http: JsonServiceClient, guard: ServiceGuard, target: SheetsTarget) -> Self {
        Self {
            http,
            guard,
            target,
        }
    }

    fn append_url(&self) -> Result<reqwest::Url> {
        let mut url = self.http.base_url().clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("sheets base URL cannot carry a path"))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                self.target.spreadsheet_id.as_str(),
                "values",
                &format!("{}:append", self.target.range),
            ]);
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl SpreadsheetSink for SheetsClient {
    async fn append_rows(&self, job_id: Uuid, batch: usize, rows: &[SheetRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let url = self.append_url()?;
        let body = AppendRequest {
            values: rows.iter().map(SheetRow::values).collect(),
        };

        let response: AppendResponse = self
            .guard
            .call(|| {
                let headers = build_append_headers(&self.target.access_token, job_id, batch);
                self.http.send_json(url.clone(), headers, &body)
            })
            .await
            .with_context(|| format!("failed to append batch {batch} to spreadsheet"))?;

        let updates = response.updates.unwrap_or_default();
        info!(
            %job_id,
            batch,
            rows = rows.len(),
            updated_rows = updates.updated_rows.unwrap_or_default(),
            updated_range = updates.updated_range.as_deref().unwrap_or(""),
            "rows appended to spreadsheet"
        );
        Ok(())
    }
}
