use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::error;

use crate::app::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) struct HealthReport {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl HealthReport {
    fn ready() -> Self {
        Self {
            status: "ready",
            detail: None,
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: "degraded",
            detail: Some(detail.into()),
        }
    }
}

pub(crate) async fn ready(
    State(state): State<AppState>,
) -> Result<Json<HealthReport>, (StatusCode, Json<HealthReport>)> {
    if let Err(error) = state.warehouse().ping().await {
        error!(%error, "warehouse readiness check failed");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthReport::degraded(format!("warehouse: {error}"))),
        ));
    }

    Ok(Json(HealthReport::ready()))
}

pub(crate) async fn live() -> Json<HealthReport> {
    Json(HealthReport {
        status: "live",
        detail: None,
    })
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use crate::app::{build_router, test_support};

    #[tokio::test]
    async fn live_is_always_ok() {
        let router = build_router(test_support::registry(test_support::warehouse(0)));

        let response = router
            .oneshot(Request::get("/health/live").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_reports_warehouse_outage() {
        let warehouse = test_support::warehouse(0);
        warehouse.fail_pings(true);
        let router = build_router(test_support::registry(warehouse));

        let response = router
            .oneshot(Request::get("/health/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(
            response.status(),
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("degraded"));
    }
}
