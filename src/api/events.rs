//! `GET /v1/jobs/{id}/events`: SSE feed of a job's progress events.

use std::{convert::Infallible, time::Duration};

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ErrorResponse, jobs::not_found};
use crate::{
    app::AppState,
    pipeline::progress::{ProgressEvent, ProgressPublisher},
    store::models::Job,
};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

type EventStream = BoxStream<'static, Result<Event, Infallible>>;

pub(crate) async fn stream(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Sse<KeepAliveStream<EventStream>>, (StatusCode, Json<ErrorResponse>)> {
    if state.scheduler().job(job_id).is_none() {
        return Err(not_found(job_id));
    }

    // Subscribe before reading the snapshot so a terminal event cannot slip between them.
    let receiver = state.progress().subscribe(job_id);
    let snapshot = state.scheduler().job(job_id).ok_or_else(|| not_found(job_id))?;

    let events: EventStream = if snapshot.status.is_terminal() {
        debug!(%job_id, status = %snapshot.status, "job already finished, sending snapshot");
        drop(receiver);
        state.progress().close(job_id);
        stream::once(async move { Ok(snapshot_event(&snapshot)) }).boxed()
    } else {
        debug!(%job_id, "sse subscriber attached");
        live_events(job_id, receiver)
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn live_events(job_id: Uuid, receiver: broadcast::Receiver<ProgressEvent>) -> EventStream {
    stream::unfold(Some(receiver), move |state| async move {
        let mut receiver = state?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let next = if event.payload.is_terminal() {
                        None
                    } else {
                        Some(receiver)
                    };
                    return Some((Ok(progress_event(&event)), next));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%job_id, skipped, "sse subscriber lagged behind, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

fn progress_event(event: &ProgressEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .id(event.sequence.to_string())
        .json_data(event)
        .unwrap_or_else(|error| {
            warn!(job_id = %event.job_id, error = %error, "failed to serialize progress event");
            Event::default().event(event.event_type())
        })
}

fn snapshot_event(job: &Job) -> Event {
    Event::default()
        .event("snapshot")
        .json_data(job)
        .unwrap_or_else(|error| {
            warn!(job_id = %job.id, error = %error, "failed to serialize job snapshot");
            Event::default().event("snapshot")
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::{
        app::{build_router, test_support},
        scheduler::PipelineFactory,
        store::models::JobStatus,
    };

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let router = build_router(test_support::registry(test_support::warehouse(0)));

        let response = router
            .oneshot(
                Request::get(format!("/v1/jobs/{}/events", Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn finished_job_replays_snapshot_and_ends() {
        let registry = test_support::registry(test_support::warehouse(0));
        let jobs = Arc::clone(registry.scheduler().registry());
        let (mut job, _) = jobs.register(5);
        job.finish(JobStatus::Completed, "completed: 0 records screened");
        jobs.store(&job);

        let response = build_router(registry)
            .oneshot(
                Request::get(format!("/v1/jobs/{}/events", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: snapshot"));
        assert!(text.contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn live_job_streams_until_terminal_event() {
        let registry = test_support::registry(test_support::warehouse(3));
        let jobs = Arc::clone(registry.scheduler().registry());
        let (job, context) = jobs.register(3);
        let pipeline = test_support::factory(
            test_support::warehouse(3),
            Arc::clone(&jobs),
            Arc::clone(registry.progress()),
        )
        .build()
        .expect("pipeline");
        let router = build_router(registry);

        let response = router
            .oneshot(
                Request::get(format!("/v1/jobs/{}/events", job.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let finished = pipeline.execute(&context).await;
        assert_eq!(finished.status, JobStatus::Completed);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("event: stage_started"));
        assert!(text.contains("event: batch_progress"));
        assert!(text.contains("event: job_completed"));
    }
}
