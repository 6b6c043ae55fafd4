use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::ErrorResponse;
use crate::{
    app::AppState,
    scheduler::CancelOutcome,
    store::models::{Job, JobStatus},
};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct StartJobRequest {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct JobAccepted {
    job_id: Uuid,
    status: JobStatus,
    limit: usize,
}

/// POST /v1/jobs
pub(crate) async fn start(
    State(state): State<AppState>,
    Json(payload): Json<StartJobRequest>,
) -> impl IntoResponse {
    if payload.limit == Some(0) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("limit must be greater than zero")),
        )
            .into_response();
    }

    match state.scheduler().start_job(payload.limit) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(JobAccepted {
                job_id: job.id,
                status: job.status,
                limit: job.limit,
            }),
        )
            .into_response(),
        Err(error) => {
            error!(error = ?error, "failed to start screening job");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new(format!("{error:#}"))),
            )
                .into_response()
        }
    }
}

/// GET /v1/jobs/{id}
pub(crate) async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    state
        .scheduler()
        .job(job_id)
        .map(Json)
        .ok_or_else(|| not_found(job_id))
}

/// POST /v1/jobs/{id}/cancel
pub(crate) async fn cancel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.scheduler().cancel(job_id) {
        CancelOutcome::Requested(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        CancelOutcome::AlreadyTerminal(job) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse::new(format!("job is already {}", job.status))),
        )
            .into_response(),
        CancelOutcome::NotFound => not_found(job_id).into_response(),
    }
}

pub(crate) fn not_found(job_id: Uuid) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(format!("job {job_id} not found"))),
    )
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::app::{ComponentRegistry, build_router, test_support};

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn router() -> (Router, std::sync::Arc<crate::scheduler::JobRegistry>) {
        let registry: ComponentRegistry = test_support::registry(test_support::warehouse(4));
        let jobs = std::sync::Arc::clone(registry.scheduler().registry());
        (build_router(registry), jobs)
    }

    #[tokio::test]
    async fn start_accepts_and_reports_the_job() {
        let (router, jobs) = router();

        let (status, body) = send(router.clone(), post_json("/v1/jobs", r#"{"limit": 2}"#)).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["limit"], 2);
        let job_id: Uuid = body["job_id"]
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .expect("job id");
        assert!(jobs.get(job_id).is_some());

        let (status, body) = send(
            router,
            Request::get(format!("/v1/jobs/{job_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], job_id.to_string());
    }

    #[tokio::test]
    async fn zero_limit_is_rejected() {
        let (router, _) = router();
        let (status, _) = send(router, post_json("/v1/jobs", r#"{"limit": 0}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (router, _) = router();
        let missing = Uuid::now_v7();

        let (status, _) = send(
            router.clone(),
            Request::get(format!("/v1/jobs/{missing}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(router, post_json(&format!("/v1/jobs/{missing}/cancel"), "")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_distinguishes_running_and_terminal_jobs() {
        let (router, jobs) = router();
        let (pending, _) = jobs.register(10);

        let (status, _) = send(
            router.clone(),
            post_json(&format!("/v1/jobs/{}/cancel", pending.id), ""),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(
            jobs.cancellation_token(pending.id)
                .is_some_and(|token| token.is_cancelled())
        );

        let (finished, _) = jobs.register(10);
        let mut done = finished.clone();
        done.finish(crate::store::models::JobStatus::Completed, "done");
        jobs.store(&done);

        let (status, body) = send(
            router,
            post_json(&format!("/v1/jobs/{}/cancel", finished.id), ""),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "job is already completed");
    }
}
