use axum::{
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};

use crate::app::AppState;

pub(crate) async fn exporter(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry().render_prometheus(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use crate::app::{build_router, test_support};

    #[tokio::test]
    async fn exposes_registered_metrics() {
        let router = build_router(test_support::registry(test_support::warehouse(0)));

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("lead_screen_jobs_started_total"));
    }
}
